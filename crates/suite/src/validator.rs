use std::path::PathBuf;

use anyhow::Result;
use colored::Colorize;

use crate::config::RunConfig;
use crate::ui;

/// Validates prerequisites for a validation run.
pub struct PrerequisitesValidator {
    requirements: Vec<Requirement>,
}

struct Requirement {
    name: String,
    check: Box<dyn Fn() -> bool>,
    install_instructions: String,
    critical: bool,
}

fn on_path(binary: &'static str) -> Box<dyn Fn() -> bool> {
    Box::new(move || which::which(binary).is_ok())
}

impl PrerequisitesValidator {
    /// Requirements for a run with `config`.
    #[must_use]
    pub fn for_run(config: &RunConfig) -> Self {
        let mut requirements = Vec::new();
        let provisions = !config.flags.only_test;

        requirements.push(Requirement {
            name: "terraform".to_string(),
            check: on_path("terraform"),
            install_instructions:
                "Install Terraform from https://developer.hashicorp.com/terraform/install"
                    .to_string(),
            critical: provisions,
        });

        requirements.push(Requirement {
            name: "ansible-playbook".to_string(),
            check: on_path("ansible-playbook"),
            install_instructions:
                "Install Ansible from https://docs.ansible.com/ansible/latest/installation_guide/"
                    .to_string(),
            critical: provisions,
        });

        requirements.push(Requirement {
            name: "kubectl".to_string(),
            check: on_path("kubectl"),
            install_instructions: "Install kubectl from https://kubernetes.io/docs/tasks/tools/"
                .to_string(),
            critical: true,
        });

        if config.provider.upload.is_some() {
            requirements.push(Requirement {
                name: "aws".to_string(),
                check: on_path("aws"),
                install_instructions: "Install the AWS CLI from https://aws.amazon.com/cli/"
                    .to_string(),
                critical: true,
            });
        }

        let key: PathBuf = config.provider.path_to_key.clone();
        requirements.push(Requirement {
            name: format!("SSH key {}", key.display()),
            check: Box::new(move || key.is_file()),
            install_instructions: "Set pathToKey in configs.yaml to an existing private key"
                .to_string(),
            critical: provisions,
        });

        Self { requirements }
    }

    /// Check every requirement and print the results.
    ///
    /// # Errors
    ///
    /// Returns an error if a critical requirement is not met.
    pub fn validate(&self) -> Result<()> {
        println!();
        let mut failures = Vec::new();

        for requirement in &self.requirements {
            let passed = (requirement.check)();
            ui::print_check_result(&requirement.name, passed);
            if !passed {
                failures.push(requirement);
            }
        }

        println!();

        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
        } else {
            ui::print_warning("Some prerequisites are not met:");
            println!();
            for failure in &failures {
                if failure.critical {
                    println!(
                        "  {} {} - {}",
                        "✗".red(),
                        failure.name.red(),
                        failure.install_instructions.bright_black()
                    );
                } else {
                    println!(
                        "  {} {} - {}",
                        "⚠".yellow(),
                        failure.name.yellow(),
                        failure.install_instructions.bright_black()
                    );
                }
            }
            println!();

            if failures.iter().any(|f| f.critical) {
                return Err(anyhow::anyhow!(
                    "Critical prerequisites not met. Please install the required tools and try again."
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(requirements: Vec<(bool, bool)>) -> PrerequisitesValidator {
        PrerequisitesValidator {
            requirements: requirements
                .into_iter()
                .enumerate()
                .map(|(i, (passes, critical))| Requirement {
                    name: format!("tool-{i}"),
                    check: Box::new(move || passes),
                    install_instructions: String::new(),
                    critical,
                })
                .collect(),
        }
    }

    #[test]
    fn test_non_critical_failure_passes() {
        assert!(validator(vec![(true, true), (false, false)]).validate().is_ok());
    }

    #[test]
    fn test_critical_failure_errors() {
        let err = validator(vec![(true, true), (false, true)]).validate().unwrap_err();
        assert!(err.to_string().contains("Critical prerequisites"));
    }
}
