pub mod credential;
pub mod exchange;
pub mod pool;

pub use credential::{AuthKind, Credential, CredentialConfig, CredentialSnapshot};
pub use exchange::{HttpTokenExchanger, TokenExchanger, TokenGrant};
pub use pool::{AcquiredCredential, CredentialPool, PoolUsage};
