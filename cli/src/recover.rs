//! `contrast recover`: hand the seed back to a restarted Coordinator.

use contrast_common::api::{RecoverResponse, RecoverRequest, RecoverySecret};
use contrast_common::seedshare::sign_recovery;
use contrast_common::transport::{seal, RECOVERY_INFO};
use contrast_common::{ContrastError, HexString, Manifest};
use zeroize::Zeroizing;

use crate::client::CoordinatorClient;
use crate::error::Result;
use crate::verify::{attest_coordinator, Purpose};
use crate::workspace::Workspace;

/// Attest the Coordinator, which must be waiting for recovery, and send it
/// the seed sealed to its attested transport key.
pub async fn recover(
    client: &CoordinatorClient,
    workspace: &Workspace,
    manifest: &Manifest,
) -> Result<RecoverResponse> {
    let attested = attest_coordinator(client, manifest, Purpose::Recover).await?;

    let owner = workspace.seedshare_owner_key()?;
    let engine = workspace.load_seed_shares()?.decrypt(&owner)?;
    let plaintext = Zeroizing::new(
        serde_json::to_vec(&RecoverySecret {
            seed: HexString::from_bytes(engine.seed()),
            salt: HexString::from_bytes(engine.salt()),
        })
        .map_err(ContrastError::from)?,
    );

    let transport_key = attested.transport_key();
    let sealed = seal(&transport_key, RECOVERY_INFO, &plaintext)?;
    let signature = sign_recovery(&owner, &transport_key, &sealed);

    let response = client
        .recover(&RecoverRequest {
            transport_key: HexString::from_bytes(&transport_key),
            sealed_seed: HexString::from_bytes(&sealed),
            signature: HexString::from_bytes(&signature),
        })
        .await?;
    tracing::info!(
        event = "coordinator_recovered",
        generation = response.generation,
        manifest_hash = %response.manifest_hash
    );
    Ok(response)
}
