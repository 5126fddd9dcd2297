//! Policy enforcement in the guest.
//!
//! An enforcer starts `Pending` with the document it was handed. It only
//! becomes `Enforcing` if the document's digest equals the host data of a
//! fresh report from the hardware; otherwise it ends up `Failed` and denies
//! everything for the lifetime of the instance.

use std::path::{Component, Path};

use contrast_common::policy::ContainerPolicy;
use contrast_common::{generate_nonce, PolicyDigest, PolicyDocument, ReportIssuer, SnpReport};

use crate::error::{AgentError, EnforcementError};
use crate::request::{AgentRequest, CreateContainer};

pub struct Pending {
    document: Vec<u8>,
}

pub struct Enforcing {
    policy: PolicyDocument,
    digest: PolicyDigest,
}

/// Terminal state: the policy was not accepted.
#[derive(Debug)]
pub struct Failed {
    reason: AgentError,
}

impl Failed {
    pub fn reason(&self) -> &AgentError {
        &self.reason
    }

    pub fn check(&self, _request: &AgentRequest) -> Result<(), EnforcementError> {
        Err(EnforcementError::PolicyRejected)
    }
}

pub struct PolicyEnforcer<S> {
    state: S,
}

impl PolicyEnforcer<Pending> {
    pub fn new(document: Vec<u8>) -> Self {
        Self {
            state: Pending { document },
        }
    }

    pub fn digest(&self) -> PolicyDigest {
        PolicyDigest::of(&self.state.document)
    }

    /// Request a report bound to a fresh nonce and activate against its host data.
    pub fn activate(self, issuer: &dyn ReportIssuer) -> Result<PolicyEnforcer<Enforcing>, Failed> {
        let mut report_data = [0u8; 64];
        report_data[..32].copy_from_slice(&generate_nonce());
        let report = match issuer
            .issue(&report_data)
            .and_then(|evidence| evidence.parse_report())
        {
            Ok(report) => report,
            Err(e) => return Err(self.fail(e.into())),
        };
        if report.report_data != report_data {
            return Err(self.fail(AgentError::StaleReport));
        }
        self.activate_with_report(&report)
    }

    /// Accept the document iff its digest equals the report's host data.
    pub fn activate_with_report(
        self,
        report: &SnpReport,
    ) -> Result<PolicyEnforcer<Enforcing>, Failed> {
        let digest = self.digest();
        if digest.as_bytes() != &report.host_data {
            let reason = AgentError::DigestMismatch {
                computed: digest.to_string(),
                host_data: hex::encode(report.host_data),
            };
            return Err(self.fail(reason));
        }
        let policy = match PolicyDocument::from_bytes(&self.state.document) {
            Ok(policy) => policy,
            Err(e) => return Err(self.fail(AgentError::InvalidPolicy(e.to_string()))),
        };
        tracing::info!(event = "policy_accepted", policy_digest = %digest);
        Ok(PolicyEnforcer {
            state: Enforcing { policy, digest },
        })
    }

    fn fail(self, reason: AgentError) -> Failed {
        tracing::error!(event = "policy_rejected", error = %reason);
        Failed { reason }
    }
}

impl PolicyEnforcer<Enforcing> {
    pub fn policy(&self) -> &PolicyDocument {
        &self.state.policy
    }

    pub fn digest(&self) -> &PolicyDigest {
        &self.state.digest
    }

    /// Allow the request only if a rule explicitly permits it.
    pub fn check(&self, request: &AgentRequest) -> Result<(), EnforcementError> {
        let rules = &self.state.policy.rules;
        match request {
            AgentRequest::CreateContainer(create) => self.check_create(create),
            AgentRequest::ExecProcess { container, command } => {
                let permitted = rules.allow_exec
                    && self
                        .container(container)?
                        .exec_commands
                        .iter()
                        .any(|allowed| allowed == command);
                if permitted {
                    Ok(())
                } else {
                    Err(EnforcementError::Exec {
                        container: container.clone(),
                        command: command.clone(),
                    })
                }
            }
            AgentRequest::ReadStream { .. } => {
                if rules.allow_logs {
                    Ok(())
                } else {
                    Err(EnforcementError::Logs)
                }
            }
            AgentRequest::CopyFile { path } => {
                let permitted = is_normal_absolute(path)
                    && rules
                        .allowed_copy_destinations
                        .iter()
                        .any(|prefix| Path::new(path).starts_with(prefix));
                if permitted {
                    Ok(())
                } else {
                    Err(EnforcementError::CopyDestination {
                        destination: path.clone(),
                    })
                }
            }
        }
    }

    fn container(&self, name: &str) -> Result<&ContainerPolicy, EnforcementError> {
        self.state
            .policy
            .container(name)
            .ok_or_else(|| EnforcementError::UnknownContainer {
                container: name.to_string(),
            })
    }

    fn check_create(&self, create: &CreateContainer) -> Result<(), EnforcementError> {
        let policy = self.container(&create.name)?;
        let container = || create.name.clone();

        let digest = create
            .image
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or(&create.image);
        if !policy.image_digests.iter().any(|d| d == digest) {
            return Err(EnforcementError::ImageDigest {
                container: container(),
                image: create.image.clone(),
            });
        }

        if policy.command != create.command {
            return Err(EnforcementError::Command {
                container: container(),
                command: create.command.clone(),
            });
        }

        if let Some(variable) = create.env.iter().find(|v| !env_permitted(&policy.env, v)) {
            return Err(EnforcementError::EnvironmentVariable {
                container: container(),
                variable: variable.clone(),
            });
        }

        for mount in &create.mounts {
            let permitted = policy.mounts.iter().any(|rule| {
                rule.destination == mount.destination && (mount.read_only || !rule.read_only)
            });
            if !permitted {
                return Err(EnforcementError::Mount {
                    container: container(),
                    destination: mount.destination.clone(),
                });
            }
        }
        Ok(())
    }
}

/// `NAME=value` matches a rule `NAME=value` exactly or `NAME=*`.
fn env_permitted(rules: &[String], variable: &str) -> bool {
    let Some((name, _)) = variable.split_once('=') else {
        return false;
    };
    rules.iter().any(|rule| {
        rule == variable || rule.strip_suffix("=*").is_some_and(|rule_name| rule_name == name)
    })
}

/// Absolute, without `..` or `.` segments.
fn is_normal_absolute(path: &str) -> bool {
    let path = Path::new(path);
    path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_)))
}

/// The agent after startup: enforcing a verified policy or denying everything.
pub enum AgentState {
    Enforcing(PolicyEnforcer<Enforcing>),
    Failed(Failed),
}

impl AgentState {
    pub fn start(document: Vec<u8>, issuer: &dyn ReportIssuer) -> Self {
        match PolicyEnforcer::new(document).activate(issuer) {
            Ok(enforcer) => AgentState::Enforcing(enforcer),
            Err(failed) => AgentState::Failed(failed),
        }
    }

    pub fn check(&self, request: &AgentRequest) -> Result<(), EnforcementError> {
        let result = match self {
            AgentState::Enforcing(enforcer) => enforcer.check(request),
            AgentState::Failed(failed) => failed.check(request),
        };
        if let Err(e) = &result {
            tracing::warn!(
                event = "request_denied",
                request = request.name(),
                rule = e.rule(),
                error = %e
            );
        }
        result
    }

    pub fn is_enforcing(&self) -> bool {
        matches!(self, AgentState::Enforcing(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Mount;
    use contrast_common::policy::{MountRule, PolicyRules};
    use contrast_common::testing::{policy_bytes, TestDeployment};

    const IMAGE: &str = "sha256:abababababababababababababababababababababababababababababababab";

    fn document(rules: PolicyRules) -> Vec<u8> {
        PolicyDocument::new(
            rules,
            vec![ContainerPolicy {
                name: "web".to_string(),
                image_digests: vec![IMAGE.to_string()],
                command: vec!["/bin/server".to_string(), "--port=8080".to_string()],
                env: vec!["PATH=/usr/bin".to_string(), "TOKEN=*".to_string()],
                mounts: vec![
                    MountRule {
                        destination: "/config".to_string(),
                        read_only: true,
                    },
                    MountRule {
                        destination: "/data".to_string(),
                        read_only: false,
                    },
                ],
                exec_commands: vec![vec!["/bin/healthcheck".to_string()]],
            }],
        )
        .to_bytes()
        .unwrap()
    }

    fn enforcing(rules: PolicyRules) -> PolicyEnforcer<Enforcing> {
        let doc = document(rules);
        let deploy = TestDeployment::new(b"agent-enforcer-test");
        let issuer = deploy.issuer(&doc);
        match PolicyEnforcer::new(doc).activate(&issuer) {
            Ok(enforcer) => enforcer,
            Err(failed) => panic!("activation failed: {}", failed.reason()),
        }
    }

    fn create() -> CreateContainer {
        CreateContainer {
            name: "web".to_string(),
            image: format!("registry.example/web@{}", IMAGE),
            command: vec!["/bin/server".to_string(), "--port=8080".to_string()],
            env: vec!["PATH=/usr/bin".to_string(), "TOKEN=s3cret".to_string()],
            mounts: vec![Mount {
                destination: "/config".to_string(),
                read_only: true,
            }],
        }
    }

    fn check_create(
        enforcer: &PolicyEnforcer<Enforcing>,
        c: CreateContainer,
    ) -> Result<(), EnforcementError> {
        enforcer.check(&AgentRequest::CreateContainer(c))
    }

    #[test]
    fn test_matching_host_data_enforces() {
        let enforcer = enforcing(PolicyRules::default());
        assert_eq!(enforcer.digest(), &PolicyDigest::of(&document(PolicyRules::default())));
        check_create(&enforcer, create()).unwrap();
    }

    #[test]
    fn test_mismatching_host_data_fails_closed() {
        let deploy = TestDeployment::new(b"agent-enforcer-test");
        let launched = policy_bytes("web", 0xAB);
        let issuer = deploy.issuer(&launched);

        // One byte differs from the document the VM was launched with.
        let mut tampered = launched.clone();
        let last = tampered.len() - 2;
        tampered[last] ^= 0x20;

        let state = AgentState::start(tampered, &issuer);
        assert!(!state.is_enforcing());
        match &state {
            AgentState::Failed(failed) => {
                assert!(matches!(failed.reason(), AgentError::DigestMismatch { .. }))
            }
            AgentState::Enforcing(_) => unreachable!(),
        }
        let read = AgentRequest::ReadStream {
            container: "web".to_string(),
        };
        assert_eq!(state.check(&read), Err(EnforcementError::PolicyRejected));

        // The unmodified document is accepted.
        assert!(AgentState::start(launched, &issuer).is_enforcing());
    }

    #[test]
    fn test_invalid_document_with_matching_digest_fails() {
        let deploy = TestDeployment::new(b"agent-enforcer-test");
        let garbage = b"not a policy".to_vec();
        let issuer = deploy.issuer(&garbage);
        let failed = PolicyEnforcer::new(garbage).activate(&issuer).err().unwrap();
        assert!(matches!(failed.reason(), AgentError::InvalidPolicy(_)));
    }

    #[test]
    fn test_create_denials_name_the_rule() {
        let enforcer = enforcing(PolicyRules::default());

        let mut c = create();
        c.name = "sidecar".to_string();
        assert_eq!(check_create(&enforcer, c).unwrap_err().rule(), "container");

        let mut c = create();
        c.image = "registry.example/web:latest".to_string();
        assert_eq!(check_create(&enforcer, c).unwrap_err().rule(), "image_digest");

        let mut c = create();
        c.command.push("--debug".to_string());
        assert_eq!(check_create(&enforcer, c).unwrap_err().rule(), "command");

        let mut c = create();
        c.env.push("LD_PRELOAD=/tmp/x.so".to_string());
        let err = check_create(&enforcer, c).unwrap_err();
        assert_eq!(
            err,
            EnforcementError::EnvironmentVariable {
                container: "web".to_string(),
                variable: "LD_PRELOAD=/tmp/x.so".to_string(),
            }
        );

        let mut c = create();
        c.env[0] = "PATH=/tmp".to_string();
        assert_eq!(check_create(&enforcer, c).unwrap_err().rule(), "env");

        let mut c = create();
        c.mounts[0].read_only = false;
        assert_eq!(check_create(&enforcer, c).unwrap_err().rule(), "mount");

        let mut c = create();
        c.mounts.push(Mount {
            destination: "/etc".to_string(),
            read_only: true,
        });
        assert_eq!(check_create(&enforcer, c).unwrap_err().rule(), "mount");

        // A read-write rule also permits a read-only mount.
        let mut c = create();
        c.mounts.push(Mount {
            destination: "/data".to_string(),
            read_only: true,
        });
        check_create(&enforcer, c).unwrap();
    }

    #[test]
    fn test_default_rules_deny_exec_logs_copy() {
        let enforcer = enforcing(PolicyRules::default());
        let exec = AgentRequest::ExecProcess {
            container: "web".to_string(),
            command: vec!["/bin/healthcheck".to_string()],
        };
        assert_eq!(enforcer.check(&exec).unwrap_err().rule(), "exec");
        let logs = AgentRequest::ReadStream {
            container: "web".to_string(),
        };
        assert_eq!(enforcer.check(&logs), Err(EnforcementError::Logs));
        let copy = AgentRequest::CopyFile {
            path: "/run/secrets/token".to_string(),
        };
        assert_eq!(enforcer.check(&copy).unwrap_err().rule(), "copy_destination");
    }

    #[test]
    fn test_rules_permit_listed_requests_only() {
        let enforcer = enforcing(PolicyRules {
            allow_exec: true,
            allow_logs: true,
            allowed_copy_destinations: vec!["/run/secrets".to_string()],
        });
        let exec = |cmd: &str| AgentRequest::ExecProcess {
            container: "web".to_string(),
            command: vec![cmd.to_string()],
        };
        enforcer.check(&exec("/bin/healthcheck")).unwrap();
        assert_eq!(enforcer.check(&exec("/bin/sh")).unwrap_err().rule(), "exec");

        enforcer
            .check(&AgentRequest::ReadStream {
                container: "web".to_string(),
            })
            .unwrap();

        let copy = |path: &str| AgentRequest::CopyFile {
            path: path.to_string(),
        };
        enforcer.check(&copy("/run/secrets/token")).unwrap();
        for denied in [
            "/run/secrets/../../etc/passwd",
            "/run/secretsevil/x",
            "run/secrets/token",
            "/etc/shadow",
        ] {
            assert!(enforcer.check(&copy(denied)).is_err(), "{}", denied);
        }
    }

    #[test]
    fn test_env_matching() {
        let rules = vec!["A=1".to_string(), "B=*".to_string()];
        assert!(env_permitted(&rules, "A=1"));
        assert!(!env_permitted(&rules, "A=2"));
        assert!(env_permitted(&rules, "B="));
        assert!(env_permitted(&rules, "B=anything"));
        assert!(!env_permitted(&rules, "BB=1"));
        assert!(!env_permitted(&rules, "B"));
    }
}
