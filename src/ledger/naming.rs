//! Resource naming
//!
//! Every external resource is addressed by a path derived only from the
//! project, the consumer group and the topic. The derivation is pure, so a
//! process that restarts resolves the same subscription it created before.

/// Derives project-scoped topic and subscription paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    project_id: String,
}

impl ResourceNames {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// `projects/<project>/topics/<topic>`
    pub fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, topic)
    }

    /// `projects/<project>/subscriptions/sub.<group>.<topic>`
    pub fn subscription_path(&self, group: &str, topic: &str) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project_id,
            subscription_id(group, topic)
        )
    }
}

/// The project-less subscription id for a (group, topic) pair.
pub fn subscription_id(group: &str, topic: &str) -> String {
    format!("sub.{group}.{topic}")
}
