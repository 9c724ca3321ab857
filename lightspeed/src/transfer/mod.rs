//! The transfer pipeline: admission, stages, progress and teardown.

pub mod gate;
pub mod io;
pub mod pipeline;
pub mod progress;
pub mod request;
pub mod session;
pub mod sink;
pub mod source;
pub mod strategy;
pub mod transcode;

pub use gate::{ConcurrencyGate, GatePermit};
pub use io::ByteStream;
pub use pipeline::{Admission, Capabilities, TransferPipeline};
pub use progress::{ProgressEvent, ProgressReceiver, TransferOutcome};
pub use request::{Resolution, TranscodeOptions, TransferMode, TransferRequest};
pub use session::Stage;
pub use source::{ExtractorCommand, YtDlp};
pub use strategy::StrategyKind;
pub use transcode::{EncoderCommand, Endpoint, Ffmpeg};
