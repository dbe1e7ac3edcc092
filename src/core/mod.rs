pub mod assistant;
pub mod chat;
pub mod gemini;
pub mod services;
pub mod traits;
