pub mod media;
pub mod output;
pub mod wav;

pub use media::{ClipSpec, Ffmpeg, MediaTool, WavMediaTool};
pub use output::*;
pub use wav::{wav_duration, Waveform};
