//! HCL rendering for raw VM provisioning.
//!
//! The provider-specific pieces (credentials, dependencies, instance body)
//! come from the user configuration as HCL snippets. Two placeholders are
//! understood inside them:
//! - `NAME_PH` in the instance body becomes the per-node name
//! - `DEP_COUNT_PH` in the dependencies becomes `count = <nodes>`

use handlebars::Handlebars;
use serde_json::json;

use crate::traits::{InfraDefinition, RenderRequest, Templater, ToolError};

const RAW_PROVISION_TEMPLATE: &str = include_str!("../templates/raw_provision.tf.hbs");

/// Placeholder for the node name inside the instance definition.
pub const NAME_PLACEHOLDER: &str = "NAME_PH";

/// Placeholder for the dependency count inside the dependencies block.
pub const DEP_COUNT_PLACEHOLDER: &str = "DEP_COUNT_PH";

/// Handlebars-backed [`Templater`].
pub struct HclTemplater {
    registry: Handlebars<'static>,
    template: String,
}

impl Default for HclTemplater {
    fn default() -> Self {
        Self::with_template(RAW_PROVISION_TEMPLATE)
    }
}

impl HclTemplater {
    /// Use a custom raw-provisioning template instead of the built-in one.
    #[must_use]
    pub fn with_template(template: impl Into<String>) -> Self {
        let mut registry = Handlebars::new();
        // HCL must be emitted verbatim
        registry.register_escape_fn(handlebars::no_escape);
        Self {
            registry,
            template: template.into(),
        }
    }

    fn validate(req: &RenderRequest) -> Result<(), ToolError> {
        let required = [
            ("provider name", &req.provider_name),
            ("provider instance name", &req.provider_instance_name),
            ("node name", &req.node_name),
            ("flavor", &req.flavor),
            ("instance definition", &req.instance_definition),
            ("public IP attribute", &req.public_ip_attribute),
            ("private IP attribute", &req.private_ip_attribute),
        ];
        for (what, value) in required {
            if value.trim().is_empty() {
                return Err(ToolError::Validation(format!("{what} is empty")));
            }
        }
        if req.node_count == 0 {
            return Err(ToolError::Validation("node count must be at least 1".into()));
        }
        Ok(())
    }
}

impl Templater for HclTemplater {
    fn render(&self, req: &RenderRequest) -> Result<InfraDefinition, ToolError> {
        Self::validate(req)?;

        let instance_definition = req
            .instance_definition
            .replace(NAME_PLACEHOLDER, "${var.instanceName}-${count.index}");
        let dependencies = req
            .dependencies
            .replace(DEP_COUNT_PLACEHOLDER, &format!("count = {}", req.node_count));

        let data = json!({
            "node_name": req.node_name,
            "node_count": req.node_count,
            "key_path": req.key_path,
            "provider_name": req.provider_name,
            "provider_instance_name": req.provider_instance_name,
            "credentials": req.credentials,
            "dependencies": dependencies,
            "flavor": req.flavor,
            "instance_definition": instance_definition,
            "extra_instance_config": req.extra_instance_config.clone().unwrap_or_default(),
            "public_ip_attribute": req.public_ip_attribute,
            "private_ip_attribute": req.private_ip_attribute,
        });

        let main_tf = self.registry.render_template(&self.template, &data)?;

        let mut variables: serde_json::Map<String, serde_json::Value> = req
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        variables.insert("customCount".into(), json!(req.node_count));
        variables.insert("instanceName".into(), json!(req.node_name));

        Ok(InfraDefinition { main_tf, variables })
    }
}

/// Random VM base name for a cluster group, e.g. `kubenode-shared-1a2b3c4d`.
#[must_use]
pub fn node_name(group: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("kubenode-{}-{}", group.to_lowercase(), &id[..8])
}
