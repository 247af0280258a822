use std::path::PathBuf;

use thiserror::Error;

/// Library error type for device and configuration operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No transport could be established: resolution or open failed.
    #[error("could not connect to display controller: {0}")]
    Connect(String),

    /// A transport is open but the device sent nothing back in time.
    #[error("display controller did not answer `{command}`")]
    DeviceUnresponsive { command: String },

    /// The transport failed mid-exchange and could not be re-established.
    #[error("connection to display controller lost: {0}")]
    ConnectionLost(String),

    /// Serial device is alive but running its ROM loader instead of the firmware.
    #[error("display controller is stuck in its bootloader")]
    BootloaderStuck,

    /// Reading or writing a persisted config file failed.
    #[error("config file {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted config record could not be encoded.
    #[error("config file {}: {source}", path.display())]
    ConfigFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
