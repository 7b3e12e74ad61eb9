//! Test doubles and builders for the distribution sync workspace.
//!
//! Everything here stands in for a network peer, a database or a clock, so
//! scenario tests under `tests/` can drive the real engine, classifier and
//! signer deterministically.

mod builders;
mod clock;
mod identity;
mod memory;
mod scripted;

pub use builders::{
    documents_found, encode_payload, entry, event_xml, full_nfe_xml, summary_entries, summary_xml,
    test_account, AccessKeyBuilder, TEST_TAX_ID,
};
pub use clock::ManualClock;
pub use identity::{self_signed, test_identity, test_pkcs12};
pub use memory::MemoryRepository;
pub use scripted::{
    no_documents, quota_exceeded, DistCall, RecordingEventTransport, ScriptedDistributionClient,
};
