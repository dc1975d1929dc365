pub mod prelude;

pub mod activity_logs;
pub mod api_keys;
pub mod ip_bans;
pub mod ip_registrations;
pub mod nodes;
pub mod sessions;
pub mod users;
