// Application detection from image references and compose labels.
//
// Only `postgres` and `mysql` change the backup strategy (logical dump
// instead of volume tar); the remaining tags are advisory metadata that
// ends up in config.json and drives the volume hint table.

use std::collections::HashMap;

pub const GENERIC: &str = "generic";

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
const IMAGE_TITLE_LABEL: &str = "org.opencontainers.image.title";

// Ordered: first match wins, databases before application types.
const PATTERNS: &[(&str, &str)] = &[
    ("timescale", "postgres"),
    ("postgres", "postgres"),
    ("mariadb", "mysql"),
    ("mysql", "mysql"),
    ("redis", "redis"),
    ("mongo", "mongo"),
    ("rabbitmq", "rabbitmq"),
    ("nginx", "nginx"),
    ("wordpress", "wordpress"),
    ("nextcloud", "nextcloud"),
    ("grafana", "grafana"),
    ("gitea", "gitea"),
    ("ghost", "ghost"),
    ("vaultwarden", "vaultwarden"),
    ("portainer", "portainer"),
    ("traefik", "traefik"),
    ("home-assistant", "homeassistant"),
    ("influxdb", "influxdb"),
    ("elasticsearch", "elastic"),
    ("minio", "minio"),
];

/// Well-known data directories, used by the legacy single-container
/// fallback when neither a stack definition nor custom paths name
/// anything to capture.
const VOLUME_HINTS: &[(&str, &str)] = &[
    ("nginx", "/usr/share/nginx/html"),
    ("wordpress", "/var/www/html"),
    ("nextcloud", "/var/www/html"),
    ("grafana", "/var/lib/grafana"),
    ("gitea", "/data"),
    ("ghost", "/var/lib/ghost/content"),
    ("vaultwarden", "/data"),
    ("portainer", "/data"),
    ("homeassistant", "/config"),
    ("influxdb", "/var/lib/influxdb"),
    ("elastic", "/usr/share/elasticsearch/data"),
    ("minio", "/data"),
];

/// Which logical dump client to run inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Postgres,
    Mysql,
}

fn match_patterns(candidate: &str) -> Option<&'static str> {
    let lower = candidate.to_lowercase();
    PATTERNS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, tag)| *tag)
}

/// Classify a container. The compose service label and the image title
/// label take precedence over the image reference.
pub fn detect_app_type(image: &str, labels: &HashMap<String, String>) -> &'static str {
    if let Some(service) = labels.get(COMPOSE_SERVICE_LABEL) {
        if let Some(tag) = match_patterns(service) {
            return tag;
        }
    }
    if let Some(title) = labels.get(IMAGE_TITLE_LABEL) {
        if let Some(tag) = match_patterns(title) {
            return tag;
        }
    }
    match_patterns(image).unwrap_or(GENERIC)
}

/// The dump branch selector: only postgres and mysql images get a
/// logical dump; everything else is captured as volume tars.
pub fn dump_kind(app_type: &str) -> Option<DumpKind> {
    match app_type {
        "postgres" => Some(DumpKind::Postgres),
        "mysql" => Some(DumpKind::Mysql),
        _ => None,
    }
}

/// Membership in the database cohort booted ahead of application
/// services during a stack restore.
pub fn is_database(app_type: &str) -> bool {
    matches!(app_type, "postgres" | "mysql" | "redis" | "mongo")
}

pub fn volume_hint(app_type: &str) -> Option<&'static str> {
    VOLUME_HINTS
        .iter()
        .find(|(tag, _)| *tag == app_type)
        .map(|(_, path)| *path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_labels() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_detects_databases_from_image() {
        assert_eq!(detect_app_type("postgres:16-alpine", &no_labels()), "postgres");
        assert_eq!(
            detect_app_type("timescale/timescaledb:latest-pg16", &no_labels()),
            "postgres"
        );
        assert_eq!(detect_app_type("mariadb:11", &no_labels()), "mysql");
        assert_eq!(detect_app_type("mysql:8.4", &no_labels()), "mysql");
        assert_eq!(detect_app_type("redis:7", &no_labels()), "redis");
        assert_eq!(detect_app_type("mongo:7", &no_labels()), "mongo");
    }

    #[test]
    fn test_generic_fallback() {
        assert_eq!(detect_app_type("alpine:3.20", &no_labels()), GENERIC);
        assert_eq!(detect_app_type("ghcr.io/acme/api:v2", &no_labels()), GENERIC);
    }

    #[test]
    fn test_service_label_takes_precedence() {
        let mut labels = HashMap::new();
        labels.insert(COMPOSE_SERVICE_LABEL.to_string(), "postgres".to_string());
        // Image alone would classify as generic.
        assert_eq!(detect_app_type("acme/bundled-db:1", &labels), "postgres");
    }

    #[test]
    fn test_image_title_label_precedence() {
        let mut labels = HashMap::new();
        labels.insert(
            "org.opencontainers.image.title".to_string(),
            "Grafana".to_string(),
        );
        assert_eq!(detect_app_type("acme/monitoring:2", &labels), "grafana");
    }

    #[test]
    fn test_dump_kind_only_for_dump_strategies() {
        assert_eq!(dump_kind("postgres"), Some(DumpKind::Postgres));
        assert_eq!(dump_kind("mysql"), Some(DumpKind::Mysql));
        assert_eq!(dump_kind("redis"), None);
        assert_eq!(dump_kind("nginx"), None);
        assert_eq!(dump_kind(GENERIC), None);
    }

    #[test]
    fn test_database_cohort() {
        assert!(is_database("postgres"));
        assert!(is_database("mysql"));
        assert!(is_database("redis"));
        assert!(is_database("mongo"));
        assert!(!is_database("rabbitmq"));
        assert!(!is_database("nginx"));
        assert!(!is_database(GENERIC));
    }

    #[test]
    fn test_volume_hints() {
        assert_eq!(volume_hint("nginx"), Some("/usr/share/nginx/html"));
        assert_eq!(volume_hint("grafana"), Some("/var/lib/grafana"));
        assert_eq!(volume_hint(GENERIC), None);
        assert_eq!(volume_hint("postgres"), None);
    }
}
