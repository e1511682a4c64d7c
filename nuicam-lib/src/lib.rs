pub mod assembler;
pub mod camera;
pub mod channel;
pub mod command;
pub mod config;
pub mod constants;
pub mod decode;
pub mod error;
pub mod iso;
pub mod mode;
pub mod register;
pub mod source;
pub mod stream;
pub mod transport;

// Re-export the main entry points for easy access
pub use camera::Camera;
pub use config::CameraConfig;
pub use error::{CamError, ProtocolError};
pub use mode::{CamMode, Endpoint};
pub use stream::{Frame, FrameStream};
