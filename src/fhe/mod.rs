// FHE client module - encrypted inputs and user decryption
//
// The homomorphic work happens on the co-processor network. This module holds the
// client-side pieces around it:
// - the `FhevmInstance` interface (encrypt inputs, user decrypt)
// - EIP-712 typed data for decryption authorizations
// - the cached, user-signed `DecryptionSignature`
// - string storage for that cache

pub mod eip712;
pub mod signature;
pub mod storage;
pub mod types;

pub use eip712::{Eip712Domain, UserDecryptTypedData};
pub use signature::DecryptionSignature;
pub use storage::{FileStringStorage, GenericStringStorage, InMemoryStringStorage};
pub use types::{
    DecryptionKeypair, EncryptedInput, EncryptedInputs, FhevmInstance, HandleContractPair, PlainValue,
};
