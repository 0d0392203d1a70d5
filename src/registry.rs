use crate::config::{Association, MethodConfig, ProviderConfig, ServiceConfig};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use url::Url;

const GROUP_NAME: &str = r"^[A-Za-z0-9_]+$";
const METHOD_NAME: &str = r"^[A-Za-z0-9_.]+$";

/// Construction-time registry errors. All of them abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid service name '{0}'")]
    InvalidGroupName(String),

    #[error("Service '{0}' has no providers")]
    NoProviders(String),

    #[error("Provider {index} of service '{group}' has an empty URL")]
    EmptyUrl { group: String, index: usize },

    #[error("Provider {index} of service '{group}' has an invalid URL '{url}': {source}")]
    InvalidUrl {
        group: String,
        index: usize,
        url: String,
        source: url::ParseError,
    },

    #[error("Provider {index} of service '{group}' has a non-websocket wsurl '{url}'")]
    InvalidWsUrl {
        group: String,
        index: usize,
        url: String,
    },

    #[error("Service '{group}' has an invalid method name '{name}'")]
    InvalidMethodName { group: String, name: String },

    #[error("Service '{group}' declares method '{name}' more than once")]
    DuplicateMethod { group: String, name: String },

    #[error("Service '{group}' is uniform but provider {index} lists its own methods")]
    UnexpectedProviderMethods { group: String, index: usize },

    #[error("Provider {index} of service '{group}' advertises undeclared method '{method}'")]
    UndeclaredMethod {
        group: String,
        index: usize,
        method: String,
    },

    #[error("Method '{method}' of service '{group}' is not served by any provider")]
    UnservedMethod { group: String, method: String },

    #[error("Service '{group}' clashes with the loopback route of service '{owner}'")]
    LoopbackNameClash { group: String, owner: String },

    #[error("Name pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),
}

/// An RPC method exposed by a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Method {
    pub name: String,
    pub block_sensitive: bool,
    pub block_specific: bool,
    pub block_arg: bool,
    /// Only archive-capable providers should serve it.
    pub archive: bool,
}

impl From<&MethodConfig> for Method {
    fn from(config: &MethodConfig) -> Self {
        Self {
            name: config.name.clone(),
            block_sensitive: config.block_sensitive,
            block_specific: config.block_specific,
            block_arg: config.block_arg,
            archive: config.archive,
        }
    }
}

/// One upstream node endpoint. `index` is its key in height reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provider {
    pub index: usize,
    pub url: String,
    pub wsurl: Option<String>,
    pub archive: bool,
    pub group: String,
    /// Methods this provider serves; `None` means every method of its group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<BTreeSet<String>>,
}

impl Provider {
    pub fn serves(&self, method: &str) -> bool {
        match &self.methods {
            Some(methods) => methods.contains(method),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub association: Association,
    /// Registry indices of this group's providers, in declaration order.
    pub providers: Vec<usize>,
    pub methods: Vec<Method>,
}

/// Static description of every group, provider and method.
#[derive(Debug, Clone)]
pub struct Registry {
    groups: BTreeMap<String, Group>,
    providers: Vec<Provider>,
}

impl Registry {
    /// Builds the registry. Providers are numbered by group name, then by
    /// their position inside the group.
    pub fn load(services: &BTreeMap<String, ServiceConfig>) -> Result<Self, ConfigError> {
        let group_name = Regex::new(GROUP_NAME)?;
        let method_name = Regex::new(METHOD_NAME)?;
        let mut groups = BTreeMap::new();
        let mut providers = Vec::new();

        for (name, service) in services {
            if !group_name.is_match(name) {
                return Err(ConfigError::InvalidGroupName(name.clone()));
            }
            // `{owner}loopback` names the owner's loopback route and pool.
            let owner = name
                .strip_suffix("loopback")
                .filter(|owner| services.contains_key(*owner));
            if let Some(owner) = owner {
                return Err(ConfigError::LoopbackNameClash {
                    group: name.clone(),
                    owner: owner.to_string(),
                });
            }
            if service.providers.is_empty() {
                return Err(ConfigError::NoProviders(name.clone()));
            }

            let methods = load_methods(name, &method_name, &service.methods)?;
            let declared: BTreeSet<&str> = methods.iter().map(|m| m.name.as_str()).collect();

            let mut members = Vec::with_capacity(service.providers.len());
            for (position, provider) in service.providers.iter().enumerate() {
                let index = providers.len();
                providers.push(load_provider(
                    name,
                    service.association,
                    &declared,
                    index,
                    position,
                    provider,
                )?);
                members.push(index);
            }

            if service.association == Association::PerMethod {
                for method in &methods {
                    let served = members.iter().any(|&i| providers[i].serves(&method.name));
                    if !served {
                        return Err(ConfigError::UnservedMethod {
                            group: name.clone(),
                            method: method.name.clone(),
                        });
                    }
                }
            }

            groups.insert(
                name.clone(),
                Group {
                    name: name.clone(),
                    association: service.association,
                    providers: members,
                    methods,
                },
            );
        }

        Ok(Self { groups, providers })
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn provider(&self, index: usize) -> Option<&Provider> {
        self.providers.get(index)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn group_providers<'a>(&'a self, group: &'a Group) -> impl Iterator<Item = &'a Provider> {
        group.providers.iter().map(move |&i| &self.providers[i])
    }
}

fn load_methods(
    group: &str,
    pattern: &Regex,
    configs: &[MethodConfig],
) -> Result<Vec<Method>, ConfigError> {
    let mut seen = BTreeSet::new();
    let mut methods = Vec::with_capacity(configs.len());

    for config in configs {
        if !pattern.is_match(&config.name) {
            return Err(ConfigError::InvalidMethodName {
                group: group.to_string(),
                name: config.name.clone(),
            });
        }
        if !seen.insert(config.name.as_str()) {
            return Err(ConfigError::DuplicateMethod {
                group: group.to_string(),
                name: config.name.clone(),
            });
        }
        methods.push(Method::from(config));
    }

    Ok(methods)
}

fn load_provider(
    group: &str,
    association: Association,
    declared: &BTreeSet<&str>,
    index: usize,
    position: usize,
    config: &ProviderConfig,
) -> Result<Provider, ConfigError> {
    let url = config.url.trim();
    if url.is_empty() {
        return Err(ConfigError::EmptyUrl {
            group: group.to_string(),
            index: position,
        });
    }
    Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
        group: group.to_string(),
        index: position,
        url: url.to_string(),
        source,
    })?;

    let wsurl = match config.wsurl.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(ws) => {
            let valid = Url::parse(ws)
                .map(|parsed| matches!(parsed.scheme(), "ws" | "wss"))
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::InvalidWsUrl {
                    group: group.to_string(),
                    index: position,
                    url: ws.to_string(),
                });
            }
            Some(ws.to_string())
        }
    };

    let methods = match (association, &config.methods) {
        (Association::Uniform, None) => None,
        (Association::Uniform, Some(_)) => {
            return Err(ConfigError::UnexpectedProviderMethods {
                group: group.to_string(),
                index: position,
            });
        }
        (Association::PerMethod, advertised) => {
            let advertised = advertised.clone().unwrap_or_default();
            if let Some(unknown) = advertised.iter().find(|m| !declared.contains(m.as_str())) {
                return Err(ConfigError::UndeclaredMethod {
                    group: group.to_string(),
                    index: position,
                    method: unknown.clone(),
                });
            }
            Some(advertised.into_iter().collect())
        }
    };

    Ok(Provider {
        index,
        url: url.to_string(),
        wsurl,
        archive: config.archive,
        group: group.to_string(),
        methods,
    })
}
