pub mod api_key;
pub use api_key::{ApiKeyService, ApiKeySummary, CreatedApiKey};

pub mod auth;
pub use auth::{AccountService, AuthError, ClientInfo, Registration};

pub mod node_token;
pub use node_token::{CredentialLookup, NodeAuthError, NodeTokenValidator, StoreNodeLookup};

pub mod nodes;
pub use nodes::{NodeError, NodeRegistration, NodeService};

pub mod password;
pub use password::PasswordHasherService;

pub mod session;
pub use session::{Claims, SessionManager, SessionSettings, TokenPair};

pub mod worker;
pub use worker::BackgroundWorker;
