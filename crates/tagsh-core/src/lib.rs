pub mod codec;
pub mod image;
pub mod ndef;
pub mod settings;
pub mod transport;

pub use codec::{safe_compress, safe_decompress, CodecError};
pub use image::{ImageAdapter, ImageError, TagImage};
pub use ndef::{NdefError, NdefMessage, NdefRecord};
pub use settings::{Settings, SettingsError};
pub use transport::{
    ScanAction, ScanEvent, SupportState, TagAdapter, TagFailure, TagIoError, TagSession,
    Transport, CONTENT_TYPE,
};
