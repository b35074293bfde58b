pub mod services;

pub use services::{discard_uploaded, upload_on_media_host, UploadedMedia};
