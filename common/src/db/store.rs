// MongoDB store handle
// Wraps the driver client and exposes the two typed collections plus
// startup-time index creation and health checking.

use crate::config::StoreConfig;
use crate::errors::RepositoryError;
use crate::models::{Batch, Job};
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use std::time::Duration;
use tracing::{info, instrument};

pub const JOBS_COLLECTION: &str = "jobs";
pub const BATCHES_COLLECTION: &str = "batches";

/// Handle to the MongoDB database holding the `jobs` and `batches`
/// collections. Cheap to clone; all repositories share one client.
#[derive(Debug, Clone)]
pub struct Store {
    database: Database,
}

impl Store {
    /// Connect to the store and verify the connection with a ping
    #[instrument(skip(config), fields(database = %config.database))]
    pub async fn connect(config: &StoreConfig) -> Result<Self, RepositoryError> {
        info!("Connecting to store");

        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?;
        options.connect_timeout = Some(Duration::from_secs(config.connect_timeout_seconds));
        options.server_selection_timeout =
            Some(Duration::from_secs(config.connect_timeout_seconds));

        let client = Client::with_options(options)
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?;
        let database = client.database(&config.database);

        let store = Self { database };
        store.health_check().await?;

        info!("Store connection established");
        Ok(store)
    }

    /// Wrap an existing database handle (used by tests)
    pub fn from_database(database: Database) -> Self {
        Self { database }
    }

    pub fn jobs(&self) -> Collection<Job> {
        self.database.collection::<Job>(JOBS_COLLECTION)
    }

    pub fn batches(&self) -> Collection<Batch> {
        self.database.collection::<Batch>(BATCHES_COLLECTION)
    }

    /// Ping the server
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), RepositoryError> {
        self.database
            .run_command(doc! {"ping": 1}, None)
            .await
            .map_err(|e| RepositoryError::HealthCheckFailed(e.to_string()))?;

        tracing::debug!("Store health check passed");
        Ok(())
    }

    /// Create the indexes both collections rely on. Idempotent; invoked once
    /// at startup.
    #[instrument(skip(self))]
    pub async fn ensure_indexes(&self) -> Result<(), RepositoryError> {
        let job_indexes = [
            doc! {"status": 1},
            doc! {"batch_id": 1},
            doc! {"user_id": 1},
            doc! {"created_at": 1},
            doc! {"started_at": 1},
        ]
        .into_iter()
        .map(|keys| IndexModel::builder().keys(keys).build())
        .collect::<Vec<_>>();

        self.jobs().create_indexes(job_indexes, None).await?;

        let batch_indexes = [
            doc! {"status": 1},
            doc! {"is_active": 1},
            doc! {"archived": 1},
            doc! {"created_at": 1},
        ]
        .into_iter()
        .map(|keys| IndexModel::builder().keys(keys).build())
        .collect::<Vec<_>>();

        self.batches().create_indexes(batch_indexes, None).await?;

        info!("Store indexes ensured");
        Ok(())
    }
}
