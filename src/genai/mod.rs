pub mod content;
pub mod image;

pub use content::{ContentClient, ContentError, ContentGenerator, ContentRequest};
pub use image::{
    ImageClient, ImageError, ImageGenerator, ImagePoll, ImageRequest, ImageSubmit, PollSettings,
    generation_size, resolve_image,
};
