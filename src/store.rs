//! On-disk cache of rule sets, one `<id>.acl` file per rule-set id.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::acl::Acl;
use crate::error::Result;
use crate::fetch::Fetch;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Route everything through the proxy
pub const ALL: &str = "all";
pub const BYPASS_LAN: &str = "bypass-lan";
pub const BYPASS_CHN: &str = "bypass-china";
pub const BYPASS_LAN_CHN: &str = "bypass-lan-china";
pub const GFWLIST: &str = "gfwlist";
pub const CHINALIST: &str = "china-list";
/// Prepared (flattened) form of the user's custom rules
pub const CUSTOM_RULES: &str = "custom-rules";
/// The user's custom rules as entered
pub const CUSTOM_RULES_USER: &str = "custom-rules-user";

/// Rule sets that are published remotely and kept fresh by the syncer
pub const BUILT_IN: &[&str] = &[BYPASS_LAN, BYPASS_CHN, BYPASS_LAN_CHN, GFWLIST, CHINALIST];

/// Whether a rule set is downloaded from the remote rule base
pub fn is_syncable(id: &str) -> bool {
    BUILT_IN.contains(&id)
}

/// Directory of cached rule files.
#[derive(Debug, Clone)]
pub struct RuleSetStore {
    dir: PathBuf,
}

impl RuleSetStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache file for a rule-set id
    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.acl"))
    }

    /// Load a cached rule set; a missing file is an empty list.
    pub fn load(&self, id: &str) -> Result<Acl> {
        Acl::from_file(self.path(id))
    }

    /// Write a rule set so readers never observe a partial file.
    pub fn save(&self, id: &str, acl: &Acl) -> Result<()> {
        let text = acl.serialize();
        self.replace_from_reader(id, &mut text.as_bytes())?;
        Ok(())
    }

    /// Stream `reader` into the cache file for `id` via a temp file and rename.
    ///
    /// Returns the number of bytes written.
    pub fn replace_from_reader(&self, id: &str, reader: &mut dyn Read) -> Result<u64> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(id);
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.dir.join(format!("{id}.acl.{}.{seq}.tmp", process::id()));

        let written = match write_file(&tmp_path, reader) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        };

        fs::rename(&tmp_path, &path)?;
        debug!(path = %path.display(), bytes = written, "rule set replaced");
        Ok(written)
    }

    /// The user's custom rules, always in bypass-all mode.
    ///
    /// Bare lines land in the proxy list. A list that ends up proxy-all is
    /// switched to bypass-all and its subnets are dropped.
    pub fn custom_rules(&self) -> Result<Acl> {
        let text = match fs::read_to_string(self.path(CUSTOM_RULES_USER)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                debug!(error = %e, "custom rules unavailable");
                String::new()
            }
        };
        let mut acl = Acl::from_text(&text, true)?;
        if !acl.bypass {
            debug!(subnets = acl.subnets.len(), "custom rules forced to bypass-all");
            acl.bypass = true;
            acl.subnets.clear();
        }
        Ok(acl)
    }

    pub fn set_custom_rules(&self, acl: &Acl) -> Result<()> {
        self.save(CUSTOM_RULES_USER, acl)
    }

    /// Make a rule set ready to compile: resolve its imports and cache the
    /// result. For [`CUSTOM_RULES`] the source is the user's custom rules.
    pub fn prepare(
        &self,
        id: &str,
        fetch: &dyn Fetch,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<Acl> {
        let mut acl = match id {
            ALL => return Ok(Acl::new()),
            CUSTOM_RULES => self.custom_rules()?,
            _ => self.load(id)?,
        };
        if acl.import_urls.is_empty() && id != CUSTOM_RULES {
            return Ok(acl);
        }
        acl.flatten(depth, fetch, cancel)?;
        self.save(id, &acl)?;
        Ok(acl)
    }
}

fn write_file(path: &Path, reader: &mut dyn Read) -> io::Result<u64> {
    let mut file = File::create(path)?;
    let written = io::copy(reader, &mut file)?;
    file.flush()?;
    file.sync_all()?;
    Ok(written)
}
