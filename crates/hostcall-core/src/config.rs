use std::{fs, path::Path, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use mlua::{Lua, LuaSerdeExt, StdLib, Value};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BridgeError;

/// Session settings. Every field has a default, so a config file only
/// names what it overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Standard libraries opened on top of the always-present base library.
    pub std_libs: Vec<String>,
    /// Chunk name shown in interpreter diagnostics.
    pub chunk_name: String,
    /// Log every host function call at debug level.
    pub trace_host_calls: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            std_libs: ["string", "table", "math", "utf8", "coroutine"]
                .into_iter()
                .map(String::from)
                .collect(),
            chunk_name: "=hostcall".into(),
            trace_host_calls: false,
        }
    }
}

impl BridgeConfig {
    /// Library names mapped onto mlua flags. `debug` is not accepted: it can
    /// only be opened through mlua's unsafe constructors.
    pub fn std_lib_flags(&self) -> Result<StdLib, BridgeError> {
        let mut libs = StdLib::NONE;
        for name in &self.std_libs {
            libs = libs | match name.as_str() {
                "coroutine" => StdLib::COROUTINE,
                "table" => StdLib::TABLE,
                "io" => StdLib::IO,
                "os" => StdLib::OS,
                "string" => StdLib::STRING,
                "utf8" => StdLib::UTF8,
                "math" => StdLib::MATH,
                "package" => StdLib::PACKAGE,
                other => return Err(BridgeError::UnknownLibrary(other.to_string())),
            };
        }
        Ok(libs)
    }

    /// Decode a Lua chunk that returns the config table. A chunk returning
    /// nothing yields the defaults.
    pub fn from_lua_source(src: &str) -> Result<Self> {
        // Map mlua::Error to anyhow via to_string(), never with `?` directly.
        let lua = Lua::new();
        let value = lua
            .load(src)
            .set_name("=config")
            .eval::<Value>()
            .map_err(|e| anyhow!(e.to_string()))?;
        if matches!(value, Value::Nil) {
            return Ok(Self::default());
        }
        lua.from_value(value).map_err(|e| anyhow!(e.to_string()))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let src = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        Self::from_lua_source(&src).with_context(|| format!("decoding {:?}", path))
    }
}

/// XDG: ~/.config/hostcall/config.lua
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "example", "hostcall").map(|p| p.config_dir().join("config.lua"))
}

/// Load the user's config; fall back to defaults on any error.
pub fn load_config_from_user() -> BridgeConfig {
    match default_config_path() {
        Some(path) if path.exists() => load_config_or_default(&path),
        _ => BridgeConfig::default(),
    }
}

/// Load `path`, falling back to defaults with a warning when the file
/// cannot be read or decoded, or names a library the bridge cannot open.
pub fn load_config_or_default(path: &Path) -> BridgeConfig {
    let loaded = BridgeConfig::load_from_file(path).and_then(|cfg| {
        cfg.std_lib_flags()
            .with_context(|| format!("validating {:?}", path))?;
        Ok(cfg)
    });
    match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), "failed to load bridge config: {e:#}");
            BridgeConfig::default()
        }
    }
}
