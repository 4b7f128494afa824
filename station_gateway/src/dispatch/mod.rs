pub mod dispatcher;
pub mod message;
