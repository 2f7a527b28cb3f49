//! # Blockchain Integration
//!
//! Contract surface, deployment lookup and wallet signing for the GlucoseCheck contract.

pub mod contracts;
pub mod deployments;
pub mod types;
pub mod wallet;

pub use contracts::GlucoseCheckContract;
pub use deployments::{Deployment, Deployments};
pub use types::*;
pub use wallet::{LocalWallet, Signer};
