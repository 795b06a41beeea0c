pub mod api;
pub mod audio;
pub mod call;
pub mod recognizer;
pub mod settings;
pub mod state;
pub mod transcript;
pub mod transport;
