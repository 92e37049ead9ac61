use std::io::Write;

use clap::{crate_authors, crate_description, crate_version, load_yaml, App};
use config::{Config, ConfigError, File};
use serde::Deserialize;

pub const DEFAULT_POOL_URL: &str = "stratum+tcp://127.0.0.1:3333";
pub const DEFAULT_WORKER_NAME: &str = "rig";
pub const DEFAULT_POOL_PASSWORD: &str = "x";
pub const DEFAULT_GPU_INDICES: &str = "0";
pub const DEFAULT_KERNEL_NAME: &str = "peach";
pub const FOLDER_DIR: &str = ".peach-miner";

#[derive(Debug, Deserialize)]
pub struct ConfigSettings {
    pub pool_url: String,
    pub wallet_address: String,
    pub worker_name: String,
    pub pool_password: String,
    pub gpu_indices: String,
    pub kernel_name: String,
}

const DEFAULT_CONFIG_FILE_CONTENT: &str = r#"wallet_address = ""
pool_url = "stratum+tcp://127.0.0.1:3333"
worker_name = "rig"
pool_password = "x"
gpu_indices = "0"
kernel_name = "peach"
"#;

impl ConfigSettings {
    #[allow(dangerous_implicit_autorefs)]
    pub fn load(expect_wallet_address: bool) -> Result<Self, ConfigError> {
        let mut s = Config::new();

        // Set defaults
        let yaml = load_yaml!("cli.yaml");
        let matches = App::from_yaml(yaml)
            .about(crate_description!())
            .author(crate_authors!("\n"))
            .version(crate_version!())
            .get_matches();
        let home_dir = match dirs::home_dir() {
            Some(some) => some,
            None => return Err(ConfigError::Message("no home directory".to_string())),
        };
        s.set_default("pool_url", DEFAULT_POOL_URL)?;
        s.set_default("worker_name", DEFAULT_WORKER_NAME)?;
        s.set_default("pool_password", DEFAULT_POOL_PASSWORD)?;
        s.set_default("gpu_indices", DEFAULT_GPU_INDICES)?;
        s.set_default("kernel_name", DEFAULT_KERNEL_NAME)?;

        // Load config from file
        let default_config_folder = home_dir.join(FOLDER_DIR);
        let default_config_toml = default_config_folder.join("config.toml");
        let default_config = default_config_folder.join("config");
        let default_config_str = default_config.to_str().unwrap();
        let config_path = match matches.value_of("config") {
            Some(config_path) => config_path,
            None => {
                if !default_config_toml.exists() {
                    if let Err(err) = std::fs::create_dir_all(&default_config_folder) {
                        eprintln!(
                            "Error: Couldn't create default config folder {}: {}",
                            default_config_folder.to_string_lossy(),
                            err
                        );
                    }
                    match std::fs::File::create(&default_config_toml) {
                        Ok(mut file) => {
                            if let Err(err) = file.write_all(DEFAULT_CONFIG_FILE_CONTENT.as_bytes())
                            {
                                eprintln!(
                                    "Error: Couldn't write default config toml file {}: {}",
                                    default_config_toml.to_string_lossy(),
                                    err
                                );
                            }
                        }
                        Err(err) => {
                            eprintln!(
                                "Error: Couldn't create default config toml file {}: {}",
                                default_config_toml.to_string_lossy(),
                                err
                            );
                        }
                    };
                }
                default_config_str
            }
        };
        s.merge(File::with_name(config_path).required(false))?;

        // Command line overrides
        if let Some(pool_url) = matches.value_of("pool_url") {
            s.set("pool_url", pool_url)?;
        }
        if let Some(wallet_address) = matches.value_of("wallet_address") {
            s.set("wallet_address", wallet_address)?;
        }
        if let Some(worker_name) = matches.value_of("worker_name") {
            s.set("worker_name", worker_name)?;
        }
        if let Some(pool_password) = matches.value_of("pool_password") {
            s.set("pool_password", pool_password)?;
        }
        if let Some(gpu_indices) = matches.value_of("gpu_indices") {
            s.set("gpu_indices", gpu_indices)?;
        }
        if let Some(kernel_name) = matches.value_of("kernel_name") {
            s.set("kernel_name", kernel_name)?;
        }

        if expect_wallet_address
            && s.get_str("wallet_address")
                .map(|wallet_address| wallet_address.is_empty())
                .unwrap_or(true)
        {
            return Err(ConfigError::Message(format!(
                "Must set wallet_address config option. You can find it in {}.toml",
                std::fs::canonicalize(&config_path)
                    .map(|path| path.to_string_lossy().to_string())
                    .unwrap_or_else(|_| config_path.to_string())
            )));
        }

        s.try_into()
    }

    pub fn gpu_index_list(&self) -> Vec<usize> {
        self.gpu_indices
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect()
    }

    /// The `<wallet>.<worker>` identity used for authorize and submit.
    pub fn stratum_user(&self) -> String {
        if self.worker_name.is_empty() {
            self.wallet_address.clone()
        } else {
            format!("{}.{}", self.wallet_address, self.worker_name)
        }
    }
}
