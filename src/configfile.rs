// src/configfile.rs
// Reads the batch runner configuration (an ini style file).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;
use thiserror::Error;

use crate::serialqueue::TransportKind;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Unable to read config file {0}: {1}")]
    Read(String, String),
    #[error("Line {0}: {1}")]
    Syntax(usize, String),
    #[error("Section not found: [{0}]")]
    SectionNotFound(String),
    #[error("Option '{1}' not found in section '[{0}]'")]
    OptionNotFound(String, String),
    #[error("Failed to parse option '{0}' value '{1}' as {2}")]
    Parse(String, String, &'static str),
    #[error("Option '{0}' in section '[{1}]' {2}")]
    Validation(String, String, String),
}

#[derive(Debug, Default, Clone)]
pub struct ConfigFile {
    // section -> option -> raw value; names are lowercase
    data: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        let cf = Self::parse(&content)?;
        debug!("Loaded config {} ({} sections)", path.display(), cf.data.len());
        Ok(cf)
    }

    /// Parses an INI-style configuration string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut data: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;

        for (lineno, line_raw) in content.lines().enumerate() {
            let lineno = lineno + 1;
            // Strip comments (everything after '#' or ';')
            let line = match line_raw.find(['#', ';']) {
                Some(index) => &line_raw[..index],
                None => line_raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim().to_lowercase();
                if name.is_empty() {
                    return Err(ConfigError::Syntax(lineno, "empty section name".into()));
                }
                data.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }

            let Some(section) = current.as_ref() else {
                return Err(ConfigError::Syntax(lineno, format!("line outside of section: {}", line_raw)));
            };
            // Accept both "key = value" and "key: value"
            let Some(split) = line.find(['=', ':']) else {
                return Err(ConfigError::Syntax(lineno, format!("malformed line: {}", line_raw)));
            };
            let key = line[..split].trim().to_lowercase();
            let value = line[split + 1..].trim().to_string();
            if key.is_empty() {
                return Err(ConfigError::Syntax(lineno, format!("empty key in section [{}]", section)));
            }
            data.entry(section.clone()).or_default().insert(key, value);
        }
        Ok(Self { data })
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.data.contains_key(&section.to_lowercase())
    }

    /// Names of all sections starting with `prefix`, in sorted order.
    pub fn sections_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.data.keys().filter(move |name| name.starts_with(prefix)).map(String::as_str)
    }

    fn lookup(&self, section: &str, option: &str) -> Result<Option<&str>, ConfigError> {
        let options = self
            .data
            .get(&section.to_lowercase())
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?;
        Ok(options.get(&option.to_lowercase()).map(String::as_str))
    }

    pub fn get_str(&self, section: &str, option: &str, default: Option<&str>) -> Result<String, ConfigError> {
        match (self.lookup(section, option)?, default) {
            (Some(v), _) => Ok(v.to_string()),
            (None, Some(d)) => Ok(d.to_string()),
            (None, None) => Err(ConfigError::OptionNotFound(section.to_string(), option.to_string())),
        }
    }

    fn get_parsed<T: std::str::FromStr>(
        &self,
        section: &str,
        option: &str,
        default: Option<T>,
        kind: &'static str,
    ) -> Result<T, ConfigError> {
        match (self.lookup(section, option)?, default) {
            (Some(v), _) => v
                .parse::<T>()
                .map_err(|_| ConfigError::Parse(option.to_string(), v.to_string(), kind)),
            (None, Some(d)) => Ok(d),
            (None, None) => Err(ConfigError::OptionNotFound(section.to_string(), option.to_string())),
        }
    }

    pub fn get_f64(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        minval: Option<f64>,
        above: Option<f64>,
    ) -> Result<f64, ConfigError> {
        let v = self.get_parsed(section, option, default, "float")?;
        if let Some(min) = minval {
            if v < min {
                return Err(ConfigError::Validation(option.into(), section.into(), format!("must have minimum of {}", min)));
            }
        }
        if let Some(above) = above {
            if v <= above {
                return Err(ConfigError::Validation(option.into(), section.into(), format!("must be above {}", above)));
            }
        }
        Ok(v)
    }

    pub fn get_u32(
        &self,
        section: &str,
        option: &str,
        default: Option<u32>,
        minval: Option<u32>,
    ) -> Result<u32, ConfigError> {
        let v = self.get_parsed(section, option, default, "integer")?;
        if let Some(min) = minval {
            if v < min {
                return Err(ConfigError::Validation(option.into(), section.into(), format!("must have minimum of {}", min)));
            }
        }
        Ok(v)
    }

    pub fn get_bool(&self, section: &str, option: &str, default: Option<bool>) -> Result<bool, ConfigError> {
        match (self.lookup(section, option)?, default) {
            (Some(v), _) => match v.to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(ConfigError::Parse(option.to_string(), v.to_string(), "boolean")),
            },
            (None, Some(d)) => Ok(d),
            (None, None) => Err(ConfigError::OptionNotFound(section.to_string(), option.to_string())),
        }
    }

    /// Look up an option whose value must be one of the keys of `choices`.
    pub fn get_choice<T: Copy>(
        &self,
        section: &str,
        option: &str,
        choices: &[(&str, T)],
        default: Option<&str>,
    ) -> Result<T, ConfigError> {
        let v = self.get_str(section, option, default)?;
        choices
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&v))
            .map(|&(_, choice)| choice)
            .ok_or_else(|| {
                let names: Vec<&str> = choices.iter().map(|(n, _)| *n).collect();
                ConfigError::Validation(option.into(), section.into(), format!("'{}' is not one of {:?}", v, names))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportCode {
    Uart,
    Can,
    File,
}

/// Settings of the `[mcu]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct McuConfig {
    pub serial: String,
    pub transport: TransportKind,
    pub baud: u32,
    pub clock_freq: f64,
    pub receive_window: u32,
    pub move_count: u32,
    pub queue_step_msgtag: u32,
    pub set_next_step_dir_msgtag: u32,
}

/// Settings of one `[stepper_<axis>]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct StepperConfig {
    pub axis: char,
    pub oid: u32,
    pub step_distance: f64,
    /// Maximum step time error, in seconds.
    pub max_error: f64,
    pub high_precision: bool,
    pub invert_dir: bool,
}

impl McuConfig {
    pub fn from_config(cf: &ConfigFile) -> Result<Self, ConfigError> {
        let transport = match cf.get_choice(
            "mcu",
            "transport",
            &[("uart", TransportCode::Uart), ("can", TransportCode::Can), ("file", TransportCode::File)],
            Some("uart"),
        )? {
            TransportCode::Uart => TransportKind::Uart,
            TransportCode::Can => TransportKind::Can { client_id: cf.get_u32("mcu", "canbus_id", None, None)? },
            TransportCode::File => TransportKind::DebugFile,
        };
        Ok(Self {
            serial: cf.get_str("mcu", "serial", None)?,
            transport,
            baud: cf.get_u32("mcu", "baud", Some(250_000), Some(2400))?,
            clock_freq: cf.get_f64("mcu", "clock_freq", None, None, Some(0.0))?,
            receive_window: cf.get_u32("mcu", "receive_window", Some(0), None)?,
            move_count: cf.get_u32("mcu", "move_count", Some(16), Some(1))?,
            queue_step_msgtag: cf.get_u32("mcu", "queue_step_msgtag", Some(20), None)?,
            set_next_step_dir_msgtag: cf.get_u32("mcu", "set_next_step_dir_msgtag", Some(21), None)?,
        })
    }
}

impl StepperConfig {
    pub fn from_config(cf: &ConfigFile, section: &str) -> Result<Self, ConfigError> {
        let axis = section
            .strip_prefix("stepper_")
            .and_then(|s| {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => None,
                }
            })
            .filter(|c| matches!(*c, 'x' | 'y' | 'z'))
            .ok_or_else(|| ConfigError::Validation("name".into(), section.into(), "must be stepper_x, stepper_y or stepper_z".into()))?;
        Ok(Self {
            axis,
            oid: cf.get_u32(section, "oid", None, None)?,
            step_distance: cf.get_f64(section, "step_distance", None, None, Some(0.0))?,
            max_error: cf.get_f64(section, "max_error", Some(0.000_025), Some(0.0), None)?,
            high_precision: cf.get_bool(section, "high_precision", Some(false))?,
            invert_dir: cf.get_bool(section, "invert_dir", Some(false))?,
        })
    }

    /// All `[stepper_*]` sections in section name order.
    pub fn all_from_config(cf: &ConfigFile) -> Result<Vec<Self>, ConfigError> {
        cf.sections_with_prefix("stepper_").map(|s| Self::from_config(cf, s)).collect()
    }
}
