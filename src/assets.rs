//! The asset list.
//!
//! An asset is a source (ingress, possibly with unlocking) paired with a
//! provider (egress to an external client). The list is built from the
//! configuration, started as a whole, and drained to completion; a failure
//! while building stops everything already built.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EgressMethod, IngressMethod, LockingMethod, SecretConfig, SecretList};
use crate::meta::Composition;
use crate::provider::{AssetProvider, FifoProvider, FileProvider, StdoutProvider};
use crate::source::{AssetSource, ClevisSource, UnsealPolicy};
use crate::tang_interface::TangClient;
use crate::{Error, Result};

/// Options shaping how the list is built.
pub struct BuildOptions {
    /// Print each source's protected header instead of unsealing.
    pub dump: bool,
    /// Relaxed tang response handling.
    pub compatible: bool,
    /// Stdin bytes captured by the configuration step, handed to the first
    /// stdin-ingress secret.
    pub stdin_payload: Option<Vec<u8>>,
    /// Retry/give-up knobs for every Clevis source.
    pub policy: UnsealPolicy,
    /// Share an existing client instead of probing the CA bundle again.
    pub client: Option<Arc<TangClient>>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dump: false,
            compatible: false,
            stdin_payload: None,
            policy: UnsealPolicy::default(),
            client: None,
        }
    }
}

pub struct AssetList {
    providers: Vec<Box<dyn AssetProvider>>,
}

impl std::fmt::Debug for AssetList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetList")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl AssetList {
    pub fn build(config: &SecretList, options: BuildOptions) -> Result<Self> {
        let meta = Composition::collect();
        meta.print_info();

        let client = match options.client {
            Some(client) => client,
            None => Arc::new(TangClient::new(None)?),
        };

        log::info!(
            "there are {} elements in the configuration, we expect that many assets",
            config.secrets.len()
        );

        let mut list = AssetList {
            providers: Vec::new(),
        };
        let mut stdin_payload = options.stdin_payload;

        for entry in &config.secrets {
            entry.print_info();
            log::debug!("creating an asset source");
            let built = create_source(
                entry,
                &meta,
                &client,
                options.policy,
                options.compatible,
                !options.dump,
                &mut stdin_payload,
            );
            let source = match built {
                Ok(source) => source,
                Err(err) => {
                    list.stop_all();
                    return Err(err);
                }
            };

            if options.dump {
                // Only asked to show the JWE content, no provider
                source.dump_info();
                continue;
            }

            log::debug!("creating a provider (to an external client) to deliver the asset");
            match create_provider(entry, source) {
                Ok(provider) => list.providers.push(provider),
                Err(err) => {
                    list.stop_all();
                    return Err(err);
                }
            }
        }

        if !options.dump && list.providers.len() != config.secrets.len() {
            list.stop_all();
            return Err(Error::ConfigInvalid(
                "inconsistent configured / running asset number".into(),
            ));
        }

        log::debug!("done building the assets, we have {}", list.providers.len());
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn start_all(&mut self) -> Result<()> {
        log::debug!(
            "we are about to start the {} assets in the asset list",
            self.providers.len()
        );
        for provider in &mut self.providers {
            provider.start()?;
        }
        Ok(())
    }

    /// Poll every provider; when one reports ready, surface its captured
    /// failure and drop it. Returns the first failure once the list is empty.
    pub fn run_to_completion(&mut self) -> Result<()> {
        log::debug!(
            "waiting for the {} assets in the asset list",
            self.providers.len()
        );
        let mut first_failure: Option<Error> = None;

        while !self.providers.is_empty() {
            let mut index = 0;
            while index < self.providers.len() {
                if self.providers[index].wait(Duration::from_millis(100)) {
                    let mut provider = self.providers.remove(index);
                    if let Err(err) = provider.take_result() {
                        eprintln!("Abnormal exception in one of the asset objects - {err}");
                        if first_failure.is_none() {
                            first_failure = Some(err);
                        }
                    }
                    provider.stop();
                } else {
                    index += 1;
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn stop_all(&mut self) {
        for provider in &mut self.providers {
            provider.stop();
        }
        self.providers.clear();
    }
}

impl Drop for AssetList {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn create_source(
    entry: &SecretConfig,
    meta: &Composition,
    client: &Arc<TangClient>,
    policy: UnsealPolicy,
    compatible: bool,
    autostart: bool,
    stdin_payload: &mut Option<Vec<u8>>,
) -> Result<Arc<dyn AssetSource>> {
    // Only Clevis unlocking exists; the enum keeps the check honest
    match entry.locking {
        LockingMethod::Clevis => {}
    }

    let source: Arc<dyn AssetSource> = if let Some(path) = entry.input.as_deref() {
        // A file and a named pipe read the same way
        log::debug!("JWE source is a file or named pipe");
        new_clevis(Some(path), None, meta, client, policy, compatible, autostart)?
    } else {
        match entry.ingress {
            IngressMethod::Stdin => {
                log::debug!("JWE source is stdin");
                new_clevis(
                    None,
                    stdin_payload.take(),
                    meta,
                    client,
                    policy,
                    compatible,
                    autostart,
                )?
            }
            IngressMethod::EnvVar => {
                return Err(Error::Unimplemented("input asset from environment"))
            }
            IngressMethod::File | IngressMethod::Pipe => {
                return Err(Error::ConfigInvalid(
                    "file or pipe ingress requires an input path".into(),
                ))
            }
        }
    };

    Ok(source)
}

#[allow(clippy::too_many_arguments)]
fn new_clevis(
    path: Option<&Path>,
    preloaded: Option<Vec<u8>>,
    meta: &Composition,
    client: &Arc<TangClient>,
    policy: UnsealPolicy,
    compatible: bool,
    autostart: bool,
) -> Result<Arc<dyn AssetSource>> {
    let source = ClevisSource::new(
        path,
        preloaded,
        meta,
        Arc::clone(client),
        policy,
        compatible,
        autostart,
    )?;
    Ok(source)
}

fn create_provider(
    entry: &SecretConfig,
    source: Arc<dyn AssetSource>,
) -> Result<Box<dyn AssetProvider>> {
    match entry.egress {
        EgressMethod::File => {
            let out = entry
                .out
                .as_ref()
                .ok_or(Error::MissingParameter("output filename"))?;
            let read_count = if entry.out_count == 0 {
                1
            } else {
                entry.out_count as usize
            };
            Ok(Box::new(FileProvider::new(source, out, read_count)))
        }
        EgressMethod::Pipe => {
            let out = entry
                .out
                .as_ref()
                .ok_or(Error::MissingParameter("output pipename"))?;
            Ok(Box::new(FifoProvider::new(source, out)))
        }
        EgressMethod::Stdout => Ok(Box::new(StdoutProvider::new(source))),
    }
}
