// Provisioner: makes sure a runner work directory holds an unpacked runner
// release, downloading and extracting the archive when it does not.

use anyhow::{Context, Result};
use futures::StreamExt;
use launcher_common::constants::path;
use launcher_common::{HttpClientFactory, LauncherContext, LauncherError, Tracing};
use launcher_sdk::{ProcessInvoker, TraceWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// What `ensure_installed` had to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub downloaded: bool,
    pub extracted: bool,
    pub dependencies_installed: bool,
    pub warnings: Vec<String>,
}

impl ProvisionReport {
    /// Nothing beyond the existence checks happened.
    pub fn was_noop(&self) -> bool {
        !self.downloaded && !self.extracted
    }
}

pub struct Provisioner {
    context: Arc<LauncherContext>,
    client: reqwest::Client,
    trace: Tracing,
}

impl Provisioner {
    pub fn new(context: Arc<LauncherContext>) -> Result<Self> {
        Ok(Self::with_client(context, HttpClientFactory::create_client()?))
    }

    pub fn with_client(context: Arc<LauncherContext>, client: reqwest::Client) -> Self {
        let trace = context.get_trace("Provisioner");
        Self {
            context,
            client,
            trace,
        }
    }

    /// Ensure `work_dir` contains `run.sh` and `config.sh`.
    ///
    /// A present `actions.tar.gz` is reused, otherwise the archive for the
    /// configured version and architecture is downloaded. Calls for the same
    /// directory are serialized. Errors are `LauncherError::ProvisioningFailed`.
    pub async fn ensure_installed(
        &self,
        runner: &str,
        work_dir: &Path,
        cancellation_token: CancellationToken,
    ) -> Result<ProvisionReport> {
        let trace = self.trace.for_runner(runner);
        let _guard = self.context.lock_work_dir(work_dir).await;

        self.provision(&trace, work_dir, cancellation_token)
            .await
            .map_err(|e| {
                anyhow::Error::from(LauncherError::ProvisioningFailed {
                    work_dir: work_dir.to_path_buf(),
                    reason: format!("{e:#}"),
                })
            })
    }

    async fn provision(
        &self,
        trace: &Tracing,
        work_dir: &Path,
        cancellation_token: CancellationToken,
    ) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::default();

        if is_installed(work_dir) {
            trace.verbose(&format!("Runner files present in {}", work_dir.display()));
            return Ok(report);
        }
        trace.info(&format!("Not finding runner files in {}", work_dir.display()));

        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;

        let archive = work_dir.join(path::ARCHIVE);
        if !archive.is_file() {
            let url = self.context.settings().archive_url();
            trace.info(&format!("Downloading from {url}"));
            self.download_file(&url, &archive, cancellation_token.clone())
                .await
                .context("Failed to download the actions runner archive")?;
            report.downloaded = true;
        }

        trace.info(&format!("Extracting {}", archive.display()));
        let (src, dest) = (archive.clone(), work_dir.to_path_buf());
        let extracted = tokio::task::spawn_blocking(move || extract_archive(&src, &dest))
            .await
            .context("Extraction task panicked")?;
        if let Err(e) = extracted {
            // A corrupt archive would fail the same way next time.
            if let Err(remove) = std::fs::remove_file(&archive) {
                trace.warning(&format!(
                    "Failed to delete {}: {remove}",
                    archive.display()
                ));
            }
            return Err(e);
        }
        report.extracted = true;

        if !is_installed(work_dir) {
            anyhow::bail!(
                "archive {} does not contain {} and {}",
                archive.display(),
                path::RUN_SCRIPT,
                path::CONFIG_SCRIPT
            );
        }

        if self.context.settings().install_dependencies {
            match self.install_dependencies(trace, work_dir, cancellation_token).await {
                Ok(()) => report.dependencies_installed = true,
                Err(e) => {
                    let warning = format!("Failed to install runner dependencies: {e:#}");
                    trace.warning(&warning);
                    report.warnings.push(warning);
                }
            }
        }

        Ok(report)
    }

    /// Download `url` to `dest`. The body is streamed to `dest.partial`,
    /// which is renamed once complete and removed on any failure.
    async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        let partial = partial_path(dest);
        let result = tokio::select! {
            result = self.stream_to(url, &partial) => result,
            _ = cancellation_token.cancelled() => Err(anyhow::anyhow!("Download cancelled")),
        };

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, dest)
            .await
            .with_context(|| format!("Failed to move download into {}", dest.display()))
    }

    async fn stream_to(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send download request")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Download failed with HTTP {}",
                response.status().as_u16()
            ));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .context("Failed to create download file")?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read download response body")?;
            file.write_all(&chunk)
                .await
                .context("Failed to write downloaded file to disk")?;
        }
        file.flush().await.context("Failed to flush download")?;
        Ok(())
    }

    /// Run `bin/installdependencies.sh`. Only one installation runs at a time
    /// across the whole launcher.
    async fn install_dependencies(
        &self,
        trace: &Tracing,
        work_dir: &Path,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        let _install = self.context.lock_install().await;
        trace.info("Installing dependencies");

        let script = work_dir.join(path::INSTALL_DEPENDENCIES_SCRIPT);
        if !script.is_file() {
            anyhow::bail!("{} not found", script.display());
        }

        let invoker = ProcessInvoker::new(Arc::new(trace.clone()));
        invoker
            .execute(
                work_dir,
                &script,
                &[],
                None,
                true,
                false,
                cancellation_token,
            )
            .await?;
        Ok(())
    }
}

/// Whether both runner entry points exist in `work_dir`.
pub fn is_installed(work_dir: &Path) -> bool {
    work_dir.join(path::RUN_SCRIPT).is_file() && work_dir.join(path::CONFIG_SCRIPT).is_file()
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(path::PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path).context("Failed to open archive file")?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest_dir)
        .context("Failed to extract tar.gz archive")?;
    Ok(())
}
