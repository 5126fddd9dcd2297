//! `contrast generate`: policies and a manifest from workload descriptors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use contrast_common::manifest::{workload_owner_key_digest, ReferenceValues};
use contrast_common::policy::{is_image_digest, ContainerPolicy, MountRule, PolicyRules};
use contrast_common::seedshare::public_key_hex;
use contrast_common::{HexString, Manifest, PolicyDigest, PolicyDocument, PolicyEntry, Role};
use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{CliError, Result};
use crate::workspace::{read_string, write_file, Workspace};

pub const POLICY_ANNOTATION: &str = "contrast.io/policy";
pub const POLICY_DIGEST_ANNOTATION: &str = "contrast.io/policy-digest";
pub const SANS_ANNOTATION: &str = "contrast.io/sans";
pub const SECRET_ID_ANNOTATION: &str = "contrast.io/workload-secret-id";
pub const ROLE_ANNOTATION: &str = "contrast.io/role";

const POD_KINDS: [&str; 5] = ["Pod", "Deployment", "StatefulSet", "DaemonSet", "Job"];

/// One pod template found in the descriptors.
#[derive(Debug, Clone)]
pub struct GeneratedWorkload {
    pub kind: String,
    pub name: String,
    pub source: PathBuf,
    pub digest: HexString,
    pub entry: PolicyEntry,
}

#[derive(Debug)]
pub struct Generated {
    pub manifest: Manifest,
    pub workloads: Vec<GeneratedWorkload>,
}

/// Annotate every descriptor under `descriptors` in place and write the
/// manifest permitting them to the workspace.
pub fn generate(
    descriptors: &Path,
    reference_values: &Path,
    workspace: &Workspace,
) -> Result<Generated> {
    let reference_values: ReferenceValues = {
        let text = read_string(reference_values)?;
        serde_json::from_str(&text).map_err(|e| CliError::parse(reference_values, e))?
    };

    let mut workloads = Vec::new();
    for path in descriptor_files(descriptors)? {
        let text = read_string(&path)?;
        let (annotated, found) = annotate_file(&path, &text)?;
        if !found.is_empty() {
            write_file(&path, annotated.as_bytes())?;
        }
        workloads.extend(found);
    }
    if workloads.is_empty() {
        return Err(CliError::Descriptor {
            path: descriptors.to_path_buf(),
            reason: "no pod templates found".to_string(),
        });
    }

    workspace.create()?;
    let owner = workspace.workload_owner_key_or_create()?;
    let seedshare_owner = workspace.seedshare_owner_key_or_create()?;

    let mut policies = BTreeMap::new();
    for workload in &workloads {
        if policies
            .insert(workload.digest.clone(), workload.entry.clone())
            .is_some()
        {
            tracing::warn!(
                workload = %workload.name,
                digest = %workload.digest,
                "identical policy generated twice; last entry wins"
            );
        }
    }
    let manifest = Manifest {
        policies,
        reference_values,
        workload_owner_key_digests: vec![workload_owner_key_digest(&owner.verifying_key())],
        seedshare_owner_pub_keys: vec![public_key_hex(&seedshare_owner.to_public_key())?],
    };
    manifest.validate()?;
    workspace.save_manifest(&manifest)?;

    tracing::info!(
        event = "manifest_generated",
        workloads = workloads.len(),
        manifest_hash = %HexString::from_bytes(&manifest.hash()?)
    );
    Ok(Generated {
        manifest,
        workloads,
    })
}

fn descriptor_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| CliError::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| CliError::io(dir, e))?.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Annotate the pod templates of one multi-document YAML file.
pub fn annotate_file(path: &Path, text: &str) -> Result<(String, Vec<GeneratedWorkload>)> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document).map_err(|e| CliError::parse(path, e))?;
        if !value.is_null() {
            documents.push(value);
        }
    }

    let mut found = Vec::new();
    for document in &mut documents {
        if let Some(workload) = annotate_document(path, document)? {
            found.push(workload);
        }
    }

    let mut out = String::new();
    for (i, document) in documents.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(document).map_err(|e| CliError::parse(path, e))?);
    }
    Ok((out, found))
}

fn annotate_document(path: &Path, document: &mut Value) -> Result<Option<GeneratedWorkload>> {
    let descriptor_err = |reason: String| CliError::Descriptor {
        path: path.to_path_buf(),
        reason,
    };

    let kind = match document.get("kind").and_then(Value::as_str) {
        Some(kind) if POD_KINDS.contains(&kind) => kind.to_string(),
        _ => return Ok(None),
    };
    let name = document
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| descriptor_err(format!("{} without metadata.name", kind)))?
        .to_string();
    let annotation = |key: &str| -> Option<String> {
        document
            .get("metadata")?
            .get("annotations")?
            .get(key)?
            .as_str()
            .map(str::to_string)
    };
    let sans = match annotation(SANS_ANNOTATION) {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => vec![name.clone(), "*".to_string()],
    };
    let role = match annotation(ROLE_ANNOTATION).as_deref() {
        Some("coordinator") => Role::Coordinator,
        Some(other) => return Err(descriptor_err(format!("{}: unknown role {}", name, other))),
        None => Role::None,
    };
    let workload_secret_id =
        annotation(SECRET_ID_ANNOTATION).unwrap_or_else(|| format!("{}/{}", kind, name));

    let template = if kind == "Pod" {
        &mut *document
    } else {
        document
            .get_mut("spec")
            .and_then(|s| s.get_mut("template"))
            .ok_or_else(|| descriptor_err(format!("{} {} has no spec.template", kind, name)))?
    };
    let pod_spec = template
        .get("spec")
        .ok_or_else(|| descriptor_err(format!("{} {} has no pod spec", kind, name)))?;
    let containers = pod_containers(pod_spec)
        .map_err(|reason| descriptor_err(format!("{} {}: {}", kind, name, reason)))?;

    let policy = PolicyDocument::new(PolicyRules::default(), containers);
    policy.validate()?;
    let bytes = policy.to_bytes()?;
    let digest = PolicyDigest::of(&bytes).to_hex();

    match template.get("metadata") {
        None | Some(Value::Null) | Some(Value::Mapping(_)) => {}
        Some(_) => return Err(descriptor_err(format!("{} {}: metadata is not a map", kind, name))),
    }
    match template.get("metadata").and_then(|m| m.get("annotations")) {
        None | Some(Value::Null) | Some(Value::Mapping(_)) => {}
        Some(_) => {
            return Err(descriptor_err(format!(
                "{} {}: annotations are not a map",
                kind, name
            )))
        }
    }
    let annotations = &mut template["metadata"]["annotations"];
    annotations[POLICY_ANNOTATION] = Value::String(BASE64.encode(&bytes));
    annotations[POLICY_DIGEST_ANNOTATION] = Value::String(digest.to_string());

    tracing::debug!(kind = %kind, name = %name, digest = %digest, "generated policy");
    Ok(Some(GeneratedWorkload {
        kind,
        name,
        source: path.to_path_buf(),
        digest,
        entry: PolicyEntry {
            sans,
            workload_secret_id: Some(workload_secret_id),
            role,
        },
    }))
}

fn strings(value: Option<&Value>) -> std::result::Result<Vec<String>, String> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("expected a string, found {:?}", v))
            })
            .collect(),
        Some(other) => Err(format!("expected a list, found {:?}", other)),
    }
}

fn pod_containers(pod_spec: &Value) -> std::result::Result<Vec<ContainerPolicy>, String> {
    let mut containers = Vec::new();
    for key in ["initContainers", "containers"] {
        let Some(list) = pod_spec.get(key) else {
            continue;
        };
        let list = list
            .as_sequence()
            .ok_or_else(|| format!("{} is not a list", key))?;
        for container in list {
            containers.push(container_policy(container)?);
        }
    }
    Ok(containers)
}

fn container_policy(container: &Value) -> std::result::Result<ContainerPolicy, String> {
    let name = container
        .get("name")
        .and_then(Value::as_str)
        .ok_or("container without name")?
        .to_string();
    let image = container
        .get("image")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("container {} has no image", name))?;
    let digest = image
        .split_once('@')
        .map(|(_, d)| d)
        .filter(|d| is_image_digest(d))
        .ok_or_else(|| {
            format!(
                "image {} of container {} is not pinned by sha256 digest",
                image, name
            )
        })?;

    let mut command = strings(container.get("command"))?;
    command.extend(strings(container.get("args"))?);

    let mut env = Vec::new();
    if let Some(vars) = container.get("env").and_then(Value::as_sequence) {
        for var in vars {
            let var_name = var
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("env entry of container {} has no name", name))?;
            match (var.get("value"), var.get("valueFrom")) {
                (Some(value), _) if !value.is_null() => {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => return Err(format!("env {} has value {:?}", var_name, other)),
                    };
                    env.push(format!("{}={}", var_name, value));
                }
                (_, Some(_)) => env.push(format!("{}=*", var_name)),
                _ => env.push(format!("{}=", var_name)),
            }
        }
    }

    let mut mounts = Vec::new();
    if let Some(list) = container.get("volumeMounts").and_then(Value::as_sequence) {
        for mount in list {
            let destination = mount
                .get("mountPath")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("volume mount of container {} has no mountPath", name))?;
            mounts.push(MountRule {
                destination: destination.to_string(),
                read_only: mount
                    .get("readOnly")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
    }

    Ok(ContainerPolicy {
        name,
        image_digests: vec![digest.to_string()],
        command,
        env,
        mounts,
        exec_commands: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abababababababababababababababababababababababababababababababab";

    fn deployment(image: &str) -> String {
        format!(
            r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: {image}
          command: ["/bin/server"]
          args: ["--port", "8080"]
          env:
            - name: MODE
              value: production
            - name: TOKEN
              valueFrom:
                secretKeyRef: {{name: t, key: t}}
          volumeMounts:
            - mountPath: /data
              readOnly: true
"#
        )
    }

    #[test]
    fn test_deployment_template_is_annotated() {
        let text = deployment(&format!("registry.example/web@{}", DIGEST));
        let (out, found) = annotate_file(Path::new("web.yml"), &text).unwrap();
        assert_eq!(found.len(), 1);
        let web = &found[0];
        assert_eq!(web.entry.sans, vec!["web".to_string(), "*".to_string()]);
        assert_eq!(web.entry.workload_secret_id.as_deref(), Some("Deployment/web"));
        assert_eq!(web.entry.role, Role::None);

        let value: Value = serde_yaml::from_str(&out).unwrap();
        let annotations = &value["spec"]["template"]["metadata"]["annotations"];
        assert_eq!(
            annotations[POLICY_DIGEST_ANNOTATION].as_str(),
            Some(web.digest.as_str())
        );
        let policy = BASE64
            .decode(annotations[POLICY_ANNOTATION].as_str().unwrap())
            .unwrap();
        assert_eq!(PolicyDigest::of(&policy).to_hex(), web.digest);

        let doc = PolicyDocument::from_bytes(&policy).unwrap();
        let container = doc.container("web").unwrap();
        assert_eq!(container.command, vec!["/bin/server", "--port", "8080"]);
        assert_eq!(container.env, vec!["MODE=production", "TOKEN=*"]);
        assert!(container.mounts[0].read_only);
        // Existing metadata survives.
        assert_eq!(
            value["spec"]["template"]["metadata"]["labels"]["app"].as_str(),
            Some("web")
        );
    }

    #[test]
    fn test_unpinned_image_is_rejected() {
        let text = deployment("registry.example/web:latest");
        let err = annotate_file(Path::new("web.yml"), &text).unwrap_err();
        assert!(err.to_string().contains("not pinned"), "{}", err);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let text = deployment(&format!("web@{}", DIGEST));
        let (_, a) = annotate_file(Path::new("a.yml"), &text).unwrap();
        let (_, b) = annotate_file(Path::new("b.yml"), &text).unwrap();
        assert_eq!(a[0].digest, b[0].digest);

        let changed = deployment(&format!("web@{}", DIGEST.replace("ab", "cd")));
        let (_, c) = annotate_file(Path::new("c.yml"), &changed).unwrap();
        assert_ne!(a[0].digest, c[0].digest);
    }

    #[test]
    fn test_annotations_and_multi_document() {
        let text = format!(
            r#"apiVersion: v1
kind: Service
metadata:
  name: coordinator
---
apiVersion: v1
kind: Pod
metadata:
  name: coordinator
  annotations:
    contrast.io/role: coordinator
    contrast.io/sans: "coordinator, coordinator.svc"
    contrast.io/workload-secret-id: coord
spec:
  containers:
    - name: coordinator
      image: coordinator@{DIGEST}
"#
        );
        let (out, found) = annotate_file(Path::new("c.yml"), &text).unwrap();
        assert_eq!(found.len(), 1);
        let coordinator = &found[0];
        assert_eq!(coordinator.entry.role, Role::Coordinator);
        assert_eq!(coordinator.entry.sans, vec!["coordinator", "coordinator.svc"]);
        assert_eq!(coordinator.entry.workload_secret_id.as_deref(), Some("coord"));
        // The Service is kept, the Pod's own metadata carries the policy.
        assert!(out.contains("kind: Service"));
        assert!(out.contains(POLICY_DIGEST_ANNOTATION));
    }
}
