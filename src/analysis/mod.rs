//! Audio analysis: signal predicates, recording checks and diagnostic plots.

pub mod analyzer;
pub mod compare;
pub mod plot;
pub mod wav;

pub use analyzer::{AudioAnalyzer, FrequencyCheck};
pub use compare::{CompareFrequency, CompareMinStrength};
pub use plot::{generate_audio_analysis, AnalysisArtifacts};
pub use wav::{find_single_recording, verify_silence_file, AudioClip, SilenceVerdict};
