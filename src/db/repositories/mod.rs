pub mod activity;
pub mod api_key;
pub mod ip;
pub mod node;
pub mod session;
pub mod user;
