//! Minimal example: per-tenant envelope encryption through a session factory.
//!
//! Run with: `RUST_LOG=lockbox=debug cargo run --example envelope_demo`
//!
//! Walks the write and read paths once per tenant:
//! - a system key wrapped by a static master key, shared by all tenants
//! - an intermediate key per tenant, wrapped by the system key
//! - payloads envelope-encrypted under the tenant's intermediate key

use std::sync::Arc;

use lockbox::crypto::KEY_LEN;
use lockbox::{
    Aes256GcmCrypto, BasicExpiringCryptoPolicy, DataRowRecord, Error, InMemoryMetastore,
    SessionFactory, StaticKeyManagementService,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // 1. Setup
    let policy: BasicExpiringCryptoPolicy = serde_json::from_str(
        r#"{"keyExpirationDays": 30, "revokeCheckMinutes": 15, "canCacheSessions": true}"#,
    )?;
    let metastore = Arc::new(InMemoryMetastore::new());
    let factory = SessionFactory::new(
        "demo",
        "service",
        metastore.clone(),
        Arc::new(StaticKeyManagementService::new(&mut [0x42; KEY_LEN])?),
        Arc::new(policy),
        Arc::new(Aes256GcmCrypto::new()?),
    );

    // 2. Encrypt one record per tenant
    let alice = factory.get_session("tenant-a")?;
    let bob = factory.get_session("tenant-b")?;
    let alice_row = alice.encrypt_payload(b"Alice, alice@example.com")?;
    let bob_row = bob.encrypt_payload(b"Bob, bob@example.com")?;

    let stored = alice_row.to_json()?;
    println!("Stored row: {stored}");
    println!("Metastore holds {} key record(s)", metastore.len());

    // 3. Decrypt from the persisted form
    let row = DataRowRecord::from_json(&stored)?;
    let plaintext = factory.get_session("tenant-a")?.decrypt_data_row_record(&row)?;
    println!("Round trip ok: {}", String::from_utf8_lossy(&plaintext));

    // 4. Tenants cannot read each other's rows
    match alice.decrypt_data_row_record(&bob_row) {
        Err(Error::MetadataMissing(reason)) => println!("Cross-tenant read refused: {reason}"),
        other => println!("Unexpected cross-tenant result: {other:?}"),
    }

    // 5. Teardown
    factory.close()?;
    Ok(())
}
