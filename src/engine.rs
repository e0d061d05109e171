use crate::artifacts::{self, ArtifactError, ArtifactKind, TemplateArtifact};
use crate::collectors::inventory::{self, GuestKind, InventoryError, InventoryItem};
use crate::collectors::status::{self, StatusSnapshot};
use crate::guests::{self, GuestAction, GuestError};
use crate::housekeeping::{self, CleanupOutcome, CleanupReport, HousekeepingError, PowerAction};
use crate::session::{Connector, HostCredential};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::error;

// Every call runs on the blocking pool with its own session.
#[derive(Clone)]
pub struct Engine {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    status_timeout: Duration,
}

fn interrupted(err: JoinError) -> String {
    error!(error = %err, "фоновая задача прервана");
    format!("задача прервана: {err}")
}

impl Engine {
    pub fn new(
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        status_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            connect_timeout,
            status_timeout,
        }
    }

    async fn run<T, F>(&self, job: F) -> Result<T, JoinError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Connector, Duration) -> T + Send + 'static,
    {
        let connector = self.connector.clone();
        let timeout = self.connect_timeout;
        tokio::task::spawn_blocking(move || job(connector.as_ref(), timeout)).await
    }

    pub async fn status(&self, credential: HostCredential) -> StatusSnapshot {
        let timeout = self.status_timeout;
        self.run(move |connector, _| status::collect(connector, &credential, timeout))
            .await
            .unwrap_or_else(|err| StatusSnapshot::offline(interrupted(err)))
    }

    pub async fn inventory(
        &self,
        credential: HostCredential,
        kind: GuestKind,
    ) -> Result<Vec<InventoryItem>, InventoryError> {
        self.run(move |connector, timeout| inventory::list(connector, &credential, timeout, kind))
            .await
            .unwrap_or_else(|err| Err(InventoryError::Remote(interrupted(err))))
    }

    pub async fn templates(&self, credential: HostCredential) -> Vec<TemplateArtifact> {
        self.run(move |connector, timeout| artifacts::list(connector, &credential, timeout))
            .await
            .unwrap_or_else(|err| {
                interrupted(err);
                Vec::new()
            })
    }

    pub async fn upload(
        &self,
        credential: HostCredential,
        local: PathBuf,
        filename: String,
        kind: ArtifactKind,
    ) -> Result<(), ArtifactError> {
        self.run(move |connector, timeout| {
            artifacts::upload(connector, &credential, timeout, &local, &filename, kind)
        })
        .await
        .unwrap_or_else(|err| Err(ArtifactError::Remote(interrupted(err))))
    }

    pub async fn download(
        &self,
        credential: HostCredential,
        filename: String,
        kind: ArtifactKind,
        local: PathBuf,
    ) -> Result<(), ArtifactError> {
        self.run(move |connector, timeout| {
            artifacts::download(connector, &credential, timeout, &filename, kind, &local)
        })
        .await
        .unwrap_or_else(|err| Err(ArtifactError::Remote(interrupted(err))))
    }

    pub async fn delete(
        &self,
        credential: HostCredential,
        filename: String,
        kind: ArtifactKind,
    ) -> Result<(), ArtifactError> {
        self.run(move |connector, timeout| {
            artifacts::delete(connector, &credential, timeout, &filename, kind)
        })
        .await
        .unwrap_or_else(|err| Err(ArtifactError::Remote(interrupted(err))))
    }

    pub async fn fetch_from_url(
        &self,
        credential: HostCredential,
        url: String,
        filename: String,
        kind: ArtifactKind,
    ) -> Result<(), ArtifactError> {
        self.run(move |connector, timeout| {
            artifacts::fetch_from_url(connector, &credential, timeout, &url, &filename, kind)
        })
        .await
        .unwrap_or_else(|err| Err(ArtifactError::Remote(interrupted(err))))
    }

    pub async fn clean_temp(&self, credential: HostCredential) -> CleanupOutcome {
        self.run(move |connector, timeout| housekeeping::clean_temp(connector, &credential, timeout))
            .await
            .unwrap_or_else(|err| CleanupOutcome {
                removed: Some(0),
                error: Some(interrupted(err)),
            })
    }

    pub async fn clean_logs(
        &self,
        credential: HostCredential,
        journal_days: Option<u32>,
        log_dirs: BTreeMap<String, usize>,
    ) -> Result<CleanupReport, HousekeepingError> {
        self.run(move |connector, timeout| {
            housekeeping::clean_logs(connector, &credential, timeout, journal_days, &log_dirs)
        })
        .await
        .unwrap_or_else(|err| Err(HousekeepingError::Remote(interrupted(err))))
    }

    pub async fn power(
        &self,
        credential: HostCredential,
        action: PowerAction,
    ) -> Result<(), HousekeepingError> {
        self.run(move |connector, timeout| {
            housekeeping::power(connector, &credential, timeout, action)
        })
        .await
        .unwrap_or_else(|err| Err(HousekeepingError::Remote(interrupted(err))))
    }

    pub async fn guest_action(
        &self,
        credential: HostCredential,
        kind: GuestKind,
        vmid: String,
        action: GuestAction,
    ) -> Result<(), GuestError> {
        self.run(move |connector, timeout| {
            guests::guest_action(connector, &credential, timeout, kind, &vmid, action)
        })
        .await
        .unwrap_or_else(|err| Err(GuestError::Remote(interrupted(err))))
    }

    pub async fn snapshot(
        &self,
        credential: HostCredential,
        kind: GuestKind,
        vmid: String,
        name: Option<String>,
    ) -> Result<String, GuestError> {
        self.run(move |connector, timeout| {
            guests::snapshot(connector, &credential, timeout, kind, &vmid, name.as_deref())
        })
        .await
        .unwrap_or_else(|err| Err(GuestError::Remote(interrupted(err))))
    }
}
