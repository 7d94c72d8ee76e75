//! Model backends for Serena.
//!
//! [`GeminiProvider`] streams `generateContent` over SSE and maps each chunk
//! into the shared [`StreamEvent`](serena_core::stream::StreamEvent) protocol.
//! [`ReliableProvider`] adds retries on top of any provider, and
//! [`GeminiImageGenerator`] covers text-to-image. The [`mock`] module holds
//! scripted stand-ins for tests.

pub mod converter;
pub mod gemini;
pub mod imagen;
pub mod mock;
pub mod reliable;
pub mod sse;

pub use gemini::GeminiProvider;
pub use imagen::{GeminiImageGenerator, ImageGenerator};
pub use reliable::{ReliableConfig, ReliableProvider};
