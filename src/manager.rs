use anyhow::{anyhow, Result};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;

use crate::{
    classifier::{Classifier, FailureKind},
    config::RdpSettings,
    credentials::{CmdkeyCredentialStore, CredentialStore, NoopCredentialStore},
    detector,
    launcher::{LaunchSpec, ProcessSpawner, TokioSpawner},
    platform::Platform,
    probe::{self, DependencyReport},
    profile::{self, ConnectionRequest, SessionConfig},
    registry::SessionRegistry,
    session::{Session, SessionArtifacts, SessionSignal, SessionStatus},
};

#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub signals: mpsc::UnboundedReceiver<SessionSignal>,
}

pub struct RdpManager {
    platform: Platform,
    settings: RdpSettings,
    classifier: Arc<Classifier>,
    spawner: Arc<dyn ProcessSpawner>,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<SessionRegistry>,
    profile_dir: PathBuf,
    linux_client: String,
}

impl RdpManager {
    pub fn new(platform: Platform, settings: RdpSettings) -> Self {
        let credentials: Arc<dyn CredentialStore> = match platform {
            Platform::Windows => Arc::new(CmdkeyCredentialStore),
            Platform::MacOs | Platform::Linux => Arc::new(NoopCredentialStore),
        };
        let linux_client = match platform {
            Platform::Linux => probe::find_linux_client(&settings),
            Platform::Windows | Platform::MacOs => None,
        };
        let manager = Self::with_collaborators(
            platform,
            settings,
            Arc::new(TokioSpawner),
            credentials,
            std::env::temp_dir(),
        );
        match linux_client {
            Some(path) => manager.with_linux_client(path.display().to_string()),
            None => manager,
        }
    }

    pub fn with_collaborators(
        platform: Platform,
        settings: RdpSettings,
        spawner: Arc<dyn ProcessSpawner>,
        credentials: Arc<dyn CredentialStore>,
        profile_dir: PathBuf,
    ) -> Self {
        let classifier = Arc::new(Classifier::new(&settings.patterns));
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&credentials),
            settings.max_log_lines,
        ));
        log::info!("remote desktop backend selected: {}", platform.as_str());
        let linux_client = settings.linux_client.clone();
        Self {
            platform,
            settings,
            classifier,
            spawner,
            credentials,
            registry,
            profile_dir,
            linux_client,
        }
    }

    pub fn with_linux_client(mut self, program: impl Into<String>) -> Self {
        self.linux_client = program.into();
        self
    }

    pub fn linux_client(&self) -> &str {
        &self.linux_client
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn settings(&self) -> &RdpSettings {
        &self.settings
    }

    /// Launches the client for `request`. Session failures after this point
    /// arrive on the returned handle's channel; `Err` is reserved for
    /// invalid requests and profile files that cannot be written.
    pub async fn connect(&self, request: ConnectionRequest) -> Result<SessionHandle> {
        let (id, config) = profile::normalize_request(&request, &self.settings)?;

        if self.registry.contains(&id) {
            self.registry
                .append_log(&id, "Connect requested for an active session; restarting it");
            self.registry.disconnect(&id);
        }
        self.registry.append_log(
            &id,
            format!("Starting {} session to {}", self.platform.as_str(), config.address()),
        );

        let (launch, artifacts) = self.prepare_launch(&id, &config).await?;
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let mut process = match self.spawner.spawn(&launch) {
            Ok(process) => process,
            Err(err) => {
                self.registry.append_log_with_level(
                    &id,
                    "ERROR",
                    format!("Failed to start {}: {err:#}", launch.program),
                );
                self.registry.release_artifacts(&id, &artifacts);
                let _ = signals_tx.send(SessionSignal::Error {
                    kind: FailureKind::SpawnFailure,
                    message: format!("{}: {err:#}", FailureKind::SpawnFailure.summary()),
                });
                let _ = signals_tx.send(SessionSignal::Close);
                return Ok(SessionHandle {
                    id,
                    signals: signals_rx,
                });
            }
        };

        let events = if self.platform.monitors_output() {
            process.take_events()
        } else {
            None
        };
        if let Some(pid) = process.pid() {
            self.registry
                .append_log(&id, format!("Started {} (pid {pid})", launch.program));
        }

        let session = Session::new(id.clone(), config, Some(process), artifacts, signals_tx);
        let instance = session.instance();
        self.registry.add(session);

        if self.platform.monitors_output() {
            let timers = detector::start_timers(
                &self.registry,
                &id,
                instance,
                self.settings.grace(),
                self.settings.deadline(),
            );
            self.registry.attach_timers(&id, instance, timers);
            if let Some(events) = events {
                let listener = detector::spawn_listener(
                    &self.registry,
                    Arc::clone(&self.classifier),
                    &id,
                    instance,
                    events,
                );
                self.registry.attach_listener(&id, instance, listener);
            }
        } else {
            let timer = detector::start_optimistic_timer(
                &self.registry,
                &id,
                instance,
                self.settings.optimistic_connect(),
            );
            self.registry.attach_timers(&id, instance, vec![timer]);
        }

        Ok(SessionHandle {
            id,
            signals: signals_rx,
        })
    }

    async fn prepare_launch(
        &self,
        id: &str,
        config: &SessionConfig,
    ) -> Result<(LaunchSpec, SessionArtifacts)> {
        match self.platform {
            Platform::Linux => Ok((
                LaunchSpec {
                    program: self.linux_client.clone(),
                    args: profile::freerdp_args(id, config, &self.settings),
                    monitored: true,
                },
                SessionArtifacts::default(),
            )),
            Platform::Windows | Platform::MacOs => {
                let platform = self.platform;
                let dir = self.profile_dir.clone();
                let id = id.to_string();
                let config = config.clone();
                let settings = self.settings.clone();
                let credentials = Arc::clone(&self.credentials);
                let registry = Arc::clone(&self.registry);
                tokio::task::spawn_blocking(move || {
                    prepare_profile_launch(
                        platform,
                        &dir,
                        &id,
                        &config,
                        &settings,
                        credentials.as_ref(),
                        &registry,
                    )
                })
                .await
                .map_err(|err| anyhow!("profile preparation task failed: {err}"))?
            }
        }
    }

    pub fn disconnect(&self, id: &str) {
        self.registry.disconnect(id.trim());
    }

    pub fn close_all(&self) {
        self.registry.close_all();
    }

    pub fn count(&self) -> usize {
        self.registry.count()
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.registry.get(id)
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.registry.statuses()
    }

    pub fn logs(&self, id: &str, limit: usize) -> Vec<String> {
        self.registry.logs(id, limit)
    }

    pub fn clear_logs(&self, id: &str) {
        self.registry.clear_logs(id);
    }

    pub fn dependencies(&self) -> DependencyReport {
        match self.platform {
            Platform::Linux => probe::linux_report(which::which(&self.linux_client).ok()),
            Platform::Windows | Platform::MacOs => probe::probe(self.platform, &self.settings),
        }
    }
}

fn prepare_profile_launch(
    platform: Platform,
    dir: &std::path::Path,
    id: &str,
    config: &SessionConfig,
    settings: &RdpSettings,
    credentials: &dyn CredentialStore,
    registry: &SessionRegistry,
) -> Result<(LaunchSpec, SessionArtifacts)> {
    let path = profile::write_profile(dir, id, config)?;
    let mut artifacts = SessionArtifacts {
        profile_path: Some(path.clone()),
        credential_target: None,
    };

    let launch = if platform == Platform::Windows {
        if !config.username.is_empty() && !config.password.is_empty() {
            let target = config.credential_target();
            match credentials.store(&target, &config.qualified_username(), &config.password) {
                Ok(()) => artifacts.credential_target = Some(target),
                Err(err) => registry.append_log_with_level(
                    id,
                    "WARN",
                    format!("Could not store credentials for {target}: {err:#}"),
                ),
            }
        }
        LaunchSpec {
            program: settings.windows_client.clone(),
            args: vec![path.display().to_string()],
            monitored: false,
        }
    } else {
        LaunchSpec {
            program: "open".to_string(),
            args: vec![
                "-a".to_string(),
                settings.macos_app.clone(),
                path.display().to_string(),
            ],
            monitored: false,
        }
    };
    Ok((launch, artifacts))
}

impl Drop for RdpManager {
    fn drop(&mut self) {
        self.registry.close_all();
    }
}
