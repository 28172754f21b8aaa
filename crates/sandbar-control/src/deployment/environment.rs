//! Per-deployment environment file generation.

use crate::compose::project_name;
use crate::config::DeploymentConfig;
use crate::types::Deployment;

/// Render the `.env` file consumed by the bring-up sequence: project
/// identity, the deployment's port block, the generated database name and
/// resource limits.
#[must_use]
pub fn render_env_file(
    deployment: &Deployment,
    project_prefix: &str,
    policy: &DeploymentConfig,
) -> String {
    let id = deployment.id.as_str();
    let project = project_name(project_prefix, &deployment.id);
    let ports = deployment.port_mappings();
    let db_name = deployment.id.db_name();

    format!(
        "# Generated environment for {id}\n\
         \n\
         # Project identification\n\
         COMPOSE_PROJECT_NAME={project}\n\
         DEPLOYMENT_ID={id}\n\
         \n\
         # Port configuration\n\
         ODOO_PORT={odoo}\n\
         ODOO_PORT_LONGPOLLING={longpolling}\n\
         ODOO_PROXY_PORT={proxy}\n\
         SMTP_PORT={smtp}\n\
         PGWEB_PORT={pgweb}\n\
         DEBUGGER_PORT={debugger}\n\
         DB_PORT={db}\n\
         \n\
         # Default Odoo configuration\n\
         ODOO_DB={db_name}\n\
         ODOO_ADMIN_PASSWORD=admin\n\
         ODOO_DEMO=true\n\
         ODOO_LOAD_LANGUAGE=en_US\n\
         \n\
         # SMTP configuration\n\
         SMTP_USER=odoo\n\
         SMTP_PASSWORD=odoo\n\
         \n\
         # PGWeb configuration\n\
         PGWEB_DATABASE_URL=postgres://odoo:odoo@db:5432/{db_name}?sslmode=disable\n\
         \n\
         # Development settings\n\
         DEBUGGER_ENABLED=true\n\
         LOG_LEVEL=info\n\
         \n\
         # Resource limits\n\
         DOCKER_CPU_LIMIT={cpu}\n\
         DOCKER_MEMORY_LIMIT={memory}\n",
        odoo = ports["odoo"],
        longpolling = ports["longpolling"],
        proxy = ports["proxy"],
        smtp = ports["smtp"],
        pgweb = ports["pgweb"],
        debugger = ports["debugger"],
        db = ports["db"],
        cpu = policy.cpu_limit,
        memory = policy.memory_limit,
    )
}

/// Parse an env file into key/value pairs, skipping comments and blanks.
#[must_use]
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;
    use std::collections::BTreeMap;

    fn deployment() -> Deployment {
        let mut d = Deployment::new(
            "app1".to_owned(),
            "a@x.com".to_owned(),
            "17.0".to_owned(),
            BTreeMap::new(),
            Environment::Devel,
            "pw".to_owned(),
        );
        d.port_base = 18000;
        d
    }

    #[test]
    fn env_file_carries_ports_and_identity() {
        let content = render_env_file(&deployment(), "openspp_", &DeploymentConfig::default());
        assert!(content.contains("COMPOSE_PROJECT_NAME=openspp_a_app1\n"));
        assert!(content.contains("DEPLOYMENT_ID=a-app1\n"));
        assert!(content.contains("ODOO_PORT=18000\n"));
        assert!(content.contains("ODOO_PORT_LONGPOLLING=18072\n"));
        assert!(content.contains("ODOO_PROXY_PORT=18099\n"));
        assert!(content.contains("SMTP_PORT=18025\n"));
        assert!(content.contains("PGWEB_PORT=18081\n"));
        assert!(content.contains("DEBUGGER_PORT=18084\n"));
        assert!(content.contains("DB_PORT=18032\n"));
        assert!(content.contains("ODOO_DB=a_app1\n"));
        assert!(content.contains("/a_app1?sslmode=disable\n"));
        assert!(content.contains("DOCKER_CPU_LIMIT=2\n"));
        assert!(content.contains("DOCKER_MEMORY_LIMIT=4GB\n"));
    }

    #[test]
    fn parsing_round_trips_generated_content() {
        let content = render_env_file(&deployment(), "openspp_", &DeploymentConfig::default());
        let pairs = parse_env_file(&content);
        let lookup: BTreeMap<_, _> = pairs.into_iter().collect();
        assert_eq!(lookup["ODOO_PORT"], "18000");
        assert_eq!(lookup["COMPOSE_PROJECT_NAME"], "openspp_a_app1");
        assert!(!lookup.contains_key("# Project identification"));
    }

    #[test]
    fn parser_tolerates_messy_lines() {
        let pairs = parse_env_file("  A=1 \n\n# comment\nB = two words \nnot-a-pair\n");
        assert_eq!(
            pairs,
            vec![
                ("A".to_owned(), "1".to_owned()),
                ("B".to_owned(), "two words".to_owned()),
            ]
        );
    }
}
