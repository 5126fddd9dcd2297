//! `contrast set`: install or update the Coordinator's manifest.

use contrast_common::api::{SetManifestRequest, SetManifestResponse};
use contrast_common::{ContrastError, HexString, Manifest, UpdateAuthorization};

use crate::client::CoordinatorClient;
use crate::error::Result;
use crate::verify::{attest_coordinator, Purpose, VerifyReport};
use crate::workspace::Workspace;

pub struct SetOutcome {
    pub response: SetManifestResponse,
    /// The Coordinator's attestation, checked before the manifest was sent.
    pub report: VerifyReport,
    /// Whether this replaced an earlier manifest.
    pub update: bool,
}

/// Attest the Coordinator against `manifest`, then set it.
///
/// Updates are signed with the workspace's workload owner key over the
/// attested active manifest hash. Seed shares returned by the first call
/// are saved to the workspace.
pub async fn set_manifest(
    client: &CoordinatorClient,
    workspace: &Workspace,
    manifest: &Manifest,
) -> Result<SetOutcome> {
    let attested = attest_coordinator(client, manifest, Purpose::SetManifest).await?;

    let (previous_manifest_hash, authorization) = match &attested.attestation.manifest_hash {
        None => (None, None),
        Some(previous) => {
            let previous_bytes: [u8; 32] = previous.to_bytes().try_into().map_err(|_| {
                ContrastError::InvalidInput("attested manifest hash must be 32 bytes".to_string())
            })?;
            let owner = workspace.workload_owner_key()?;
            let authorization = UpdateAuthorization::sign(&owner, &previous_bytes, manifest)?;
            (Some(previous.clone()), Some(authorization))
        }
    };
    let update = previous_manifest_hash.is_some();

    let response = client
        .set_manifest(&SetManifestRequest {
            manifest: manifest.clone(),
            previous_manifest_hash,
            authorization,
        })
        .await?;

    let expected = HexString::from_bytes(&manifest.hash()?);
    if response.manifest_hash != expected {
        tracing::warn!(
            expected = %expected,
            returned = %response.manifest_hash,
            "Coordinator reports a different manifest hash"
        );
    }
    if let Some(shares) = &response.seed_shares {
        workspace.save_seed_shares(shares)?;
        tracing::info!(shares = shares.seed_shares.len(), "saved seed shares");
    }
    tracing::info!(
        event = "manifest_set",
        update,
        generation = response.generation,
        manifest_hash = %response.manifest_hash
    );
    Ok(SetOutcome {
        response,
        report: attested.report,
        update,
    })
}
