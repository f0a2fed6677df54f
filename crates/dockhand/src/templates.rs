//! Application templates consumed by the install pipeline.
//!
//! A template names one or more services, each a container description
//! whose string fields may contain `${PARAM}` or `${PARAM:-default}`
//! placeholders filled from install parameters.

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::db;
use crate::engine::{ContainerSpec, validate_container_name};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub services: Vec<TemplateService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateService {
    /// Service key inside the template, not the container name.
    pub name: String,
    #[serde(flatten)]
    pub container: ContainerSpec,
}

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
});

impl AppTemplate {
    /// Parse YAML or JSON template text.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim_start();
        let template: AppTemplate = if trimmed.starts_with('{') {
            serde_json::from_str(trimmed).context("parsing JSON template")?
        } else {
            serde_yaml::from_str(text).context("parsing YAML template")?
        };
        template.validate()?;
        Ok(template)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let template: AppTemplate =
            serde_json::from_value(value).context("parsing template object")?;
        template.validate()?;
        Ok(template)
    }

    /// Structural checks that hold before parameters are substituted.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("template name cannot be empty");
        }
        if self.services.is_empty() {
            bail!("template '{}' defines no services", self.name);
        }
        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                bail!("template '{}' has a service without a name", self.name);
            }
            if !seen.insert(service.name.as_str()) {
                bail!("duplicate service '{}' in template", service.name);
            }
            if service.container.image.trim().is_empty() {
                bail!("service '{}' has no image", service.name);
            }
        }
        Ok(())
    }

    /// Placeholders that have no default and so must be supplied.
    pub fn required_params(&self) -> BTreeSet<String> {
        let text = serde_json::to_string(self).unwrap_or_default();
        PLACEHOLDER_RE
            .captures_iter(&text)
            .filter(|c| c.get(2).is_none())
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Substitute every placeholder. Fails listing all missing parameters.
    pub fn render(&self, params: &HashMap<String, String>) -> Result<AppTemplate> {
        let missing: Vec<String> = self
            .required_params()
            .into_iter()
            .filter(|p| !params.contains_key(p))
            .collect();
        if !missing.is_empty() {
            bail!("missing template parameters: {}", missing.join(", "));
        }

        let mut value = serde_json::to_value(self).context("serializing template")?;
        substitute(&mut value, params);
        let rendered: AppTemplate =
            serde_json::from_value(value).context("rebuilding rendered template")?;
        rendered.validate()?;
        Ok(rendered)
    }

    /// Container name for a service: explicit `containerName`, else `<app>-<service>`.
    pub fn container_name(&self, app_name: &str, service: &TemplateService) -> Result<String> {
        let name = match service.container.name {
            Some(ref explicit) => explicit.clone(),
            None => format!("{}-{}", slug(app_name), slug(&service.name)),
        };
        validate_container_name(&name).map_err(|e| anyhow!(e.user_message()))?;
        Ok(name)
    }
}

fn substitute(value: &mut Value, params: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = PLACEHOLDER_RE
                    .replace_all(s, |caps: &Captures| {
                        params
                            .get(&caps[1])
                            .cloned()
                            .or_else(|| caps.get(2).map(|d| d.as_str().to_string()))
                            .unwrap_or_default()
                    })
                    .into_owned();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, params)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, params)),
        _ => {}
    }
}

fn slug(text: &str) -> String {
    let slug: String = text
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}

/// A template as stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredTemplate {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

impl StoredTemplate {
    pub fn template(&self) -> Result<AppTemplate> {
        AppTemplate::parse(&self.content)
    }
}

#[derive(Debug, Clone)]
pub struct TemplateRepository {
    pool: SqlitePool,
}

impl TemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace by template name.
    pub async fn upsert(&self, template: &AppTemplate, content: &str) -> Result<StoredTemplate> {
        let now = db::now();
        sqlx::query(
            r#"
            INSERT INTO app_templates (id, name, description, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&template.name)
        .bind(&template.description)
        .bind(content)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("saving template")?;

        self.get_by_name(&template.name)
            .await?
            .ok_or_else(|| anyhow!("template '{}' vanished after save", template.name))
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredTemplate>> {
        let row = sqlx::query_as::<_, StoredTemplate>(
            r#"
            SELECT id, name, description, content, created_at, updated_at
            FROM app_templates
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching template")?;
        Ok(row)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<StoredTemplate>> {
        let row = sqlx::query_as::<_, StoredTemplate>(
            r#"
            SELECT id, name, description, content, created_at, updated_at
            FROM app_templates
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching template by name")?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const WORDPRESS: &str = r#"
name: wordpress
description: Blog with database
services:
  - name: db
    image: mariadb:${DB_VERSION:-11}
    env:
      MARIADB_ROOT_PASSWORD: ${DB_PASSWORD}
    volumes:
      - ${DATA_DIR}/db:/var/lib/mysql
  - name: web
    image: wordpress:latest
    ports:
      - "${HTTP_PORT:-8080}:80"
    restartPolicy: unless-stopped
"#;

    #[test]
    fn parses_yaml_and_reports_required_params() {
        let template = AppTemplate::parse(WORDPRESS).unwrap();
        assert_eq!(template.services.len(), 2);
        assert_eq!(
            template.required_params().into_iter().collect::<Vec<_>>(),
            vec!["DATA_DIR".to_string(), "DB_PASSWORD".to_string()]
        );
    }

    #[test]
    fn render_substitutes_params_and_defaults() {
        let template = AppTemplate::parse(WORDPRESS).unwrap();
        let params = HashMap::from([
            ("DB_PASSWORD".to_string(), "s3cret".to_string()),
            ("DATA_DIR".to_string(), "/srv/wp".to_string()),
        ]);
        let rendered = template.render(&params).unwrap();
        let db = &rendered.services[0].container;
        assert_eq!(db.image, "mariadb:11");
        assert_eq!(db.env["MARIADB_ROOT_PASSWORD"], "s3cret");
        assert_eq!(db.volumes[0], "/srv/wp/db:/var/lib/mysql");
        assert_eq!(rendered.services[1].container.ports[0], "8080:80");
        assert!(rendered.services[1].container.to_config().is_ok());
    }

    #[test]
    fn render_lists_missing_params() {
        let template = AppTemplate::parse(WORDPRESS).unwrap();
        let err = template.render(&HashMap::new()).unwrap_err().to_string();
        assert!(err.contains("DATA_DIR"));
        assert!(err.contains("DB_PASSWORD"));
    }

    #[test]
    fn rejects_structurally_invalid_templates() {
        assert!(AppTemplate::parse("name: empty\nservices: []\n").is_err());
        assert!(
            AppTemplate::parse(r#"{"name":"x","services":[{"name":"a","image":"nginx"},{"name":"a","image":"redis"}]}"#)
                .is_err()
        );
        assert!(AppTemplate::parse("not: [valid").is_err());
    }

    #[test]
    fn container_names_default_to_app_and_service() {
        let template = AppTemplate::parse(
            r#"{"name":"x","services":[{"name":"web","image":"nginx"},{"name":"db","containerName":"shared-db","image":"postgres"}]}"#,
        )
        .unwrap();
        assert_eq!(
            template
                .container_name("My Blog", &template.services[0])
                .unwrap(),
            "my-blog-web"
        );
        assert_eq!(
            template.container_name("x", &template.services[1]).unwrap(),
            "shared-db"
        );
    }

    #[tokio::test]
    async fn upsert_replaces_by_name() {
        let db = Database::in_memory().await.unwrap();
        let repo = TemplateRepository::new(db.pool().clone());
        let template = AppTemplate::parse(WORDPRESS).unwrap();

        let first = repo.upsert(&template, WORDPRESS).await.unwrap();
        let second = repo.upsert(&template, WORDPRESS).await.unwrap();
        assert_eq!(first.id, second.id);

        let stored = repo.get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.template().unwrap().name, "wordpress");
    }
}
