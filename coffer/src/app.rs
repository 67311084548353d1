use std::{path::Path, time::Duration};

use anyhow::{Error, Result};
use coffer_renter::{host::LocalHosts, types::FileId, Renter};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::{io::AsyncWriteExt, select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    cli::{Commands, HostsCommand},
    initialize_stderr_logging, initialize_ui_logging,
    state::{parse_host, resolve_file},
    Cli, State,
};

pub struct App {
    cli: Cli,
    multi_progress: MultiProgress,
}

impl App {
    pub fn new(cli: Cli) -> Result<App> {
        Ok(App {
            cli,
            multi_progress: MultiProgress::new(),
        })
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        if self.cli.version() {
            println!("coffer {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        if self.cli.no_ui() {
            initialize_stderr_logging()
        } else {
            initialize_ui_logging(self.multi_progress.clone());
        }

        let state = State::open(&self.cli.state_dir()?).await?;
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Set up ctrl-c handler
        let ctrl_c_cancel = cancel.clone();
        tasks.spawn(async move {
            select! {
                _ = ctrl_c_cancel.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received ctrl-c, shutting down...");
                    ctrl_c_cancel.cancel();
                }
            }
        });

        let res = self.run_with_state(&state, &cancel).await;
        cancel.cancel();
        tasks.join_all().await;
        let saved = state.save().await;
        if let Err(e) = res {
            error!(err = e.to_string());
            return Err(e);
        }
        saved
    }

    #[tracing::instrument(skip_all, err)]
    async fn run_with_state(&self, state: &State, cancel: &CancellationToken) -> Result<()> {
        if let Commands::Hosts { command } = &self.cli.commands {
            return Self::hosts(state, command).await;
        }

        let renter = state.renter(self.cli.renter_config()).await?;
        renter.set_bandwidth_limit(self.cli.rate_limit_down, self.cli.rate_limit_up);

        match &self.cli.commands {
            Commands::Mine { blocks } => {
                state.chain.mine_blocks(*blocks);
                let report = renter.maintain_contracts(cancel).await?;
                println!(
                    "height {}: formed {}, renewed {}, expired {}, replaced {}",
                    report.height,
                    report.formed.len(),
                    report.renewed.len(),
                    report.expired.len(),
                    report.replaced.len(),
                );
            }
            Commands::Upload {
                path,
                data_pieces,
                parity_pieces,
            } => {
                renter.maintain_contracts(cancel).await?;
                let upload = renter
                    .start_upload(path, *data_pieces, *parity_pieces, cancel.child_token())
                    .await?;
                let spinner = self.multi_progress.add(ProgressBar::new_spinner());
                spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
                spinner.set_message(format!("Uploading {}", path.display()));
                spinner.enable_steady_tick(Duration::from_millis(100));
                let id = upload.file_id();
                let res = upload.wait().await;
                spinner.finish_and_clear();
                res?;
                let info = renter.file_info(&id).await?;
                println!(
                    "{} {} redundancy {:.2}/{:.2}",
                    info.id, info.path, info.redundancy, info.full_redundancy
                );
            }
            Commands::Download { file, output_path } => {
                let id = resolve_file(&renter, file)?;
                self.download(&renter, &id, output_path, cancel).await?;
            }
            Commands::Stream { file, from, to } => {
                let id = resolve_file(&renter, file)?;
                let to = match to {
                    Some(to) => *to,
                    None => renter.file_info(&id).await?.size,
                };
                let data = renter.stream_range(&id, *from, to, cancel).await?;
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            Commands::Info { file } => {
                let id = resolve_file(&renter, file)?;
                println!("{:#?}", renter.file_info(&id).await?);
            }
            Commands::Ls => {
                for info in renter.files().await {
                    println!(
                        "{} {:>12} {:>2}+{:<2} {:.2} {}",
                        info.id,
                        info.size,
                        info.data_pieces,
                        info.parity_pieces,
                        info.redundancy,
                        info.path
                    );
                }
            }
            Commands::Rm { file } => {
                let id = resolve_file(&renter, file)?;
                renter.delete_file(&id).await?;
            }
            Commands::Contracts => {
                println!("height {}", renter.height());
                for c in renter.list_contracts() {
                    println!(
                        "{} host {} {:?} end {} rev {}{}{}",
                        c.id,
                        c.host,
                        c.state,
                        c.end_height,
                        c.revision_number,
                        if c.good_for_renew { "" } else { " !renew" },
                        if c.good_for_upload { "" } else { " !upload" },
                    );
                }
            }
            Commands::Repair => {
                renter.maintain_contracts(cancel).await?;
                println!("{:#?}", renter.repair(cancel).await?);
            }
            Commands::Hosts { .. } | Commands::Version => {
                return Err(Error::msg("unexpected subcommand"));
            }
        }
        Ok(())
    }

    async fn hosts(state: &State, command: &HostsCommand) -> Result<()> {
        match command {
            HostsCommand::Add { count } => {
                for host in state.add_hosts(*count) {
                    println!("{} {}", host.key, host.net_address);
                }
            }
            HostsCommand::Ls => {
                for host in state.hosts.hosts() {
                    println!("{} {}", host.key, host.net_address);
                }
            }
            HostsCommand::Offline { key, online } => {
                let key = parse_host(key)?;
                if !state.hosts.set_online(&key, *online) {
                    return Err(Error::msg(format!("no host {}", key)));
                }
            }
            HostsCommand::Remove { key } => {
                let key = parse_host(key)?;
                if !state.hosts.remove_host(&key).await {
                    return Err(Error::msg(format!("no host {}", key)));
                }
            }
        }
        Ok(())
    }

    async fn download(
        &self,
        renter: &Renter<LocalHosts>,
        id: &FileId,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let handle = renter.start_download(id, output_path, cancel.child_token())?;
        let progress = self.multi_progress.add(ProgressBar::new(0));
        progress.set_style(ProgressStyle::with_template(
            "{msg} {wide_bar} {binary_bytes}/{binary_total_bytes}",
        )?);
        progress.set_message("Downloading");
        let mut ticks = tokio::time::interval(Duration::from_millis(100));
        while !handle.is_finished() {
            ticks.tick().await;
            let status = handle.progress();
            progress.set_length(status.length);
            progress.set_position(status.received);
        }
        let written = handle.wait().await?;
        progress.finish_with_message("Download complete");
        info!(bytes = written, path = %output_path.display(), "downloaded");
        Ok(())
    }
}
