pub use super::activity_logs::Entity as ActivityLogs;
pub use super::api_keys::Entity as ApiKeys;
pub use super::ip_bans::Entity as IpBans;
pub use super::ip_registrations::Entity as IpRegistrations;
pub use super::nodes::Entity as Nodes;
pub use super::sessions::Entity as Sessions;
pub use super::users::Entity as Users;
