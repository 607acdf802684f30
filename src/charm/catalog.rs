//! Static integration catalog.
//!
//! Maps an integration id to the relation block the operator manifest
//! needs: direction, relation name, interface, optionality and cardinality
//! limit. Extending the catalog is a data change only; pipeline logic never
//! special-cases an id.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Provide,
    Require,
}

#[derive(Debug, Clone, Copy)]
pub struct Integration {
    pub id: &'static str,
    /// Relation name written into the manifest (not always the id).
    pub relation: &'static str,
    pub interface: &'static str,
    pub direction: Direction,
    pub optional: bool,
    pub limit: Option<u64>,
}

pub const CATALOG: &[Integration] = &[
    Integration {
        id: "prometheus",
        relation: "metrics-endpoint",
        interface: "prometheus_scrape",
        direction: Direction::Provide,
        optional: false,
        limit: None,
    },
    Integration {
        id: "grafana",
        relation: "grafana-dashboard",
        interface: "grafana_dashboard",
        direction: Direction::Provide,
        optional: false,
        limit: None,
    },
    Integration {
        id: "ingress",
        relation: "ingress",
        interface: "ingress",
        direction: Direction::Require,
        optional: false,
        limit: Some(1),
    },
    Integration {
        id: "loki",
        relation: "logging",
        interface: "loki_push_api",
        direction: Direction::Require,
        optional: false,
        limit: None,
    },
    Integration {
        id: "postgresql",
        relation: "postgresql",
        interface: "postgresql_client",
        direction: Direction::Require,
        optional: false,
        limit: Some(1),
    },
    Integration {
        id: "tracing",
        relation: "tracing",
        interface: "tracing",
        direction: Direction::Require,
        optional: true,
        limit: Some(1),
    },
    Integration {
        id: "smtp",
        relation: "smtp",
        interface: "smtp",
        direction: Direction::Require,
        optional: true,
        limit: Some(1),
    },
    Integration {
        id: "openfga",
        relation: "openfga",
        interface: "openfga",
        direction: Direction::Require,
        optional: true,
        limit: Some(1),
    },
    Integration {
        id: "oidc",
        relation: "oidc",
        interface: "oauth",
        direction: Direction::Require,
        optional: true,
        limit: Some(1),
    },
    Integration {
        id: "http-proxy",
        relation: "http-proxy",
        interface: "http_proxy",
        direction: Direction::Require,
        optional: true,
        limit: Some(1),
    },
];

pub fn lookup(id: &str) -> Option<&'static Integration> {
    CATALOG.iter().find(|entry| entry.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_known_ids() {
        let prometheus = lookup("prometheus").unwrap();
        assert_eq!(prometheus.relation, "metrics-endpoint");
        assert_eq!(prometheus.direction, Direction::Provide);

        let ingress = lookup("ingress").unwrap();
        assert_eq!(ingress.direction, Direction::Require);
        assert_eq!(ingress.limit, Some(1));
    }

    #[test]
    fn lookup_misses_unknown_ids() {
        assert!(lookup("kafka").is_none());
    }

    #[test]
    fn catalog_ids_are_unique() {
        for (i, a) in CATALOG.iter().enumerate() {
            for b in &CATALOG[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
    }
}
