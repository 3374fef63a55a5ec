use std::sync::Arc;

use tracing::warn;

use authgate::config::{init_logging, load_config, print_schema};
use authgate::kubeclient::memory::MemoryCluster;
use authgate::kubeclient::AccessTarget;
use authgate::startup::{self, ClusterDependencies};

#[tokio::main]
async fn main() {
    if std::env::args().any(|arg| arg == "--schema") {
        print_schema();
        return;
    }

    let config = Arc::new(load_config());
    init_logging(&config.logging);

    // The real cluster transport is provided by the embedding control plane;
    // the standalone binary falls back to the in-memory backing so the auth
    // flow can be exercised end to end in development.
    warn!("No cluster transport linked; using the in-memory cluster backing");
    let cluster = Arc::new(MemoryCluster::new(["default"]));
    let dependencies = ClusterDependencies {
        privileged: cluster.privileged_reader(),
        factory: Arc::new(cluster),
        operator_target: AccessTarget {
            group: "clusters.example.io".to_string(),
            resource: "managedclusters".to_string(),
        },
    };

    if let Err(e) = startup::run(config, dependencies).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
