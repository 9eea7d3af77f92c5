// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::auth;

#[derive(Parser)]
#[command(name = "forest-messager", version, about = "Message lifecycle service for Filecoin-compatible chains")]
pub struct Cli {
    /// Path to the TOML configuration; defaults apply when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the messager daemon.
    Run,
    /// Token management against the configured JWT secret.
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Subcommand)]
pub enum AuthCommand {
    /// Mint a token with the given permission level.
    CreateToken {
        /// One of: read, write, sign, admin.
        #[arg(long, default_value = "read")]
        perm: String,
    },
}

/// Expand a permission level to the claim list it implies.
pub fn perms_for_level(level: &str) -> anyhow::Result<Vec<String>> {
    let perms = match level {
        "read" => auth::READ,
        "write" => auth::WRITE,
        "sign" => auth::SIGN,
        "admin" => auth::ADMIN,
        other => anyhow::bail!("unknown permission level `{other}`"),
    };
    Ok(perms.iter().map(|s| s.to_string()).collect())
}
