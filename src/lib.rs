//! # GlucoseCheck Client
//!
//! Client-side workflow for the encrypted GlucoseCheck contract. Users submit an
//! encrypted glucose reading, ask the contract to compute an encrypted "is risky" flag
//! (reading > 140), and decrypt that flag through an FHE co-processor network.
//!
//! The workflow coordinator guards every pipeline against account, chain and contract
//! switches, retries transient relayer failures, and keeps mirrored handles fresh with a
//! background poller. A local devnet implements the contract and co-processor in-process.

pub mod types;
pub mod blockchain;
pub mod fhe;
pub mod coordinator;
pub mod devnet;
pub mod config;
pub mod telemetry;

// Re-export commonly used types
pub use types::{
    Address, ChainId, CiphertextHandle, ClearValue, GlucoseCheckError, GlucoseCheckResult, TxHash,
    LOCAL_CHAIN_ID, SEPOLIA_CHAIN_ID,
};

// Re-export the workflow coordinator
pub use coordinator::{
    AutoRefreshPoller, CoordinatorOptions, CoordinatorSnapshot, PipelineOutcome, PipelineState, RefreshOutcome,
    RetryPolicy, SkipReason, WorkflowCoordinator,
};

// Re-export blockchain and FHE seams
pub use blockchain::{Deployment, Deployments, GlucoseCheckContract, LocalWallet, Signer};
pub use fhe::{DecryptionSignature, FhevmInstance, GenericStringStorage};

pub use config::ClientConfig;
pub use devnet::LocalFhevmNode;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
