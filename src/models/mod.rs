pub mod organizer;
pub mod post;
pub mod event;

pub use organizer::Organizer;
pub use post::{NewPost, Post, PostStatus};
pub use event::{ExtractedEvent, NewEvent};
