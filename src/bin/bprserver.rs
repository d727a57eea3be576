// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.


//! Worker-side server: accepts renewed proxies for a job and stops
//! the job if its proxy runs out.
use std::path::PathBuf;
use std::process::exit;

use bpr_delegation::config::BPRConfig;
use bpr_delegation::gss::gsi::GSIProvider;
use bpr_delegation::server::run_server;
use bpr_delegation::server::ServerArgs;
use bpr_delegation::server::ServerError;
use bpr_delegation::server::EXIT_FATAL;
use bpr_delegation::server::EXIT_OK;
use bpr_delegation::store::ProxyStore;
use clap::Parser;
use log::error;

/// Watch a batch job and keep its X.509 proxy fresh.
#[derive(Debug, Parser)]
#[command(name = "bprserver", version, about, long_about = None)]
struct Args {
    /// YAML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Process ID of the job.
    pid: i32,

    /// `[POLL_INTERVAL] [MIN_LIFETIME] JOB_ID`, times in seconds.
    #[arg(required = true, num_args = 1..=3, value_name = "ARGS")]
    rest: Vec<String>
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_FATAL } else { EXIT_OK };

            let _ = err.print();

            exit(code)
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .init();

    let Args { config, pid, rest } = args;
    let res = ServerArgs::from_positionals(pid, rest).and_then(
        |server_args| {
            let config = BPRConfig::for_tool(config.as_deref())
                .map_err(|err| ServerError::Usage {
                    msg: err.to_string()
                })?;
            let provider = GSIProvider::new(
                config.delegation().clone(),
                config.session()
            );

            run_server(&provider, &server_args, config, ProxyStore::from_env())
        }
    );

    match res {
        Ok(_) => exit(EXIT_OK),
        Err(err) => {
            error!(target: "bpr-server",
                   "{}",
                   err);

            exit(err.exit_code())
        }
    }
}
