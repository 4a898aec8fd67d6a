pub mod bootstrap;

pub use bootstrap::{BootstrapEngine, BootstrapOutcome, BootstrapPolicy, IdentitySource};
