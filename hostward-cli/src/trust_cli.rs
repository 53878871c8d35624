//! Trust store CLI commands
//!
//! Provides the user interface for managing remembered host identities:
//! list, remove, clear, rename, approve, history, verify, fingerprint

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use hostward_core::trust::{
    decode_material, fingerprint_material, format_fingerprint, Fingerprint, FingerprintStyle,
    IdentityKind, PendingVerification, RecordKey, Scope, TrustError, TrustManager, TrustRecord,
    TrustVerifier, VerificationOutcome, Verdict,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Subcommand, Debug)]
pub enum TrustCommand {
    /// List remembered identities
    List {
        /// Only this connection's scope
        #[clap(long, conflicts_with = "global")]
        connection: Option<String>,

        /// Only the global scope
        #[clap(long)]
        global: bool,

        /// Include superseded fingerprints
        #[clap(long)]
        history: bool,

        /// Fingerprint display style (colon or hyphen)
        #[clap(long, default_value = "colon")]
        style: FingerprintStyle,

        /// Output as JSON
        #[clap(long)]
        json: bool,
    },

    /// Forget one remembered identity
    Remove {
        #[clap(flatten)]
        target: TargetArgs,
    },

    /// Forget every identity in one scope
    Clear {
        /// Connection scope to clear (default: global)
        #[clap(long)]
        connection: Option<String>,

        /// Do not ask for confirmation
        #[clap(long)]
        force: bool,
    },

    /// Set or remove a record's nickname
    Rename {
        #[clap(flatten)]
        target: TargetArgs,

        /// New nickname
        #[clap(long, required_unless_present = "clear_nickname")]
        nickname: Option<String>,

        /// Remove the nickname
        #[clap(long, conflicts_with = "nickname")]
        clear_nickname: bool,
    },

    /// Pin a fingerprint as user-approved (required for strict policy)
    Approve {
        #[clap(flatten)]
        target: TargetArgs,

        /// Fingerprint to pin (sha256:..., bare hex or AB:CD:... form)
        #[clap(long)]
        fingerprint: String,
    },

    /// Show superseded fingerprints of a record
    History {
        #[clap(flatten)]
        target: TargetArgs,

        #[clap(long, default_value = "colon")]
        style: FingerprintStyle,
    },

    /// Verify a presented fingerprint as a connection would
    Verify {
        #[clap(flatten)]
        target: TargetArgs,

        /// Fingerprint the host presented
        #[clap(long)]
        fingerprint: String,

        /// Accept without prompting if confirmation is needed
        #[clap(long, conflicts_with = "no")]
        yes: bool,

        /// Reject without prompting if confirmation is needed
        #[clap(long)]
        no: bool,
    },

    /// Compute the fingerprint of a certificate or public key file
    Fingerprint {
        /// Identity kind (tls or ssh)
        #[clap(long)]
        kind: IdentityKind,

        /// DER/PEM certificate, or SSH key blob/.pub file
        #[clap(long)]
        file: PathBuf,

        #[clap(long, default_value = "colon")]
        style: FingerprintStyle,
    },
}

/// Which record a command applies to
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Identity kind (tls or ssh)
    #[clap(long)]
    pub kind: IdentityKind,

    /// Host name or address
    #[clap(long)]
    pub host: String,

    /// Port (default: 443 for tls, 22 for ssh)
    #[clap(long)]
    pub port: Option<u16>,

    /// Connection scope (default: global)
    #[clap(long)]
    pub connection: Option<String>,
}

impl TargetArgs {
    pub fn key(&self) -> Result<RecordKey> {
        let port = self.port.unwrap_or(match self.kind {
            IdentityKind::Tls => 443,
            IdentityKind::Ssh => 22,
        });
        Ok(RecordKey::new(self.kind, &self.host, port)?)
    }

    pub fn scope(&self) -> Scope {
        Scope::from_connection_id(self.connection.as_deref())
    }
}

impl TrustCommand {
    pub async fn execute(&self, verifier: &TrustVerifier) -> Result<()> {
        let manager = verifier.manager();
        match self {
            TrustCommand::List {
                connection,
                global,
                history,
                style,
                json,
            } => trust_list(&manager, connection.as_deref(), *global, *history, *style, *json).await,
            TrustCommand::Remove { target } => trust_remove(&manager, target).await,
            TrustCommand::Clear { connection, force } => {
                trust_clear(&manager, connection.as_deref(), *force).await
            }
            TrustCommand::Rename {
                target,
                nickname,
                clear_nickname,
            } => {
                let nickname = if *clear_nickname {
                    None
                } else {
                    nickname.as_deref()
                };
                trust_rename(&manager, target, nickname).await
            }
            TrustCommand::Approve {
                target,
                fingerprint,
            } => trust_approve(&manager, target, fingerprint).await,
            TrustCommand::History { target, style } => trust_history(&manager, target, *style).await,
            TrustCommand::Verify {
                target,
                fingerprint,
                yes,
                no,
            } => {
                let preset = match (*yes, *no) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                };
                trust_verify(verifier, target, fingerprint, preset).await
            }
            TrustCommand::Fingerprint { kind, file, style } => trust_fingerprint(*kind, file, *style),
        }
    }
}

// Table row structure for record display
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Nickname")]
    nickname: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Approved")]
    approved: String,
    #[tabled(rename = "Last Seen")]
    last_seen: String,
}

impl RecordRow {
    fn new(scope: &Scope, record: &TrustRecord, style: FingerprintStyle) -> Self {
        RecordRow {
            scope: scope.to_string(),
            kind: record.kind.to_string(),
            host: format!("{}:{}", record.host, record.port),
            nickname: record.nickname.clone().unwrap_or_default(),
            fingerprint: format_fingerprint(record.fingerprint(), style),
            approved: if record.user_approved { "yes" } else { "no" }.to_string(),
            last_seen: record.identity.last_seen.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

fn render_table<T: Tabled>(rows: &[T]) -> String {
    Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string()
}

async fn trust_list(
    manager: &TrustManager,
    connection: Option<&str>,
    global: bool,
    history: bool,
    style: FingerprintStyle,
    json: bool,
) -> Result<()> {
    let scoped: Vec<(Scope, Vec<TrustRecord>)> = if global {
        vec![(Scope::Global, manager.list(&Scope::Global).await?)]
    } else if let Some(id) = connection {
        let scope = Scope::connection(id);
        let records = manager.list(&scope).await?;
        vec![(scope, records)]
    } else {
        manager.list_all().await?
    };

    if json {
        let entries: Vec<serde_json::Value> = scoped
            .iter()
            .flat_map(|(scope, records)| {
                records.iter().map(move |record| {
                    serde_json::json!({
                        "scope": scope,
                        "record": record,
                    })
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let rows: Vec<RecordRow> = scoped
        .iter()
        .flat_map(|(scope, records)| records.iter().map(move |r| RecordRow::new(scope, r, style)))
        .collect();

    if rows.is_empty() {
        println!("No trusted identities.");
        return Ok(());
    }

    println!("{} trusted identities\n", rows.len());
    println!("{}", render_table(&rows));

    if history {
        for (scope, records) in &scoped {
            for record in records.iter().filter(|r| !r.history.is_empty()) {
                println!("\n📜 {} ({})", record.key(), scope);
                for entry in record.history.entries() {
                    println!(
                        "   {}  replaced {}",
                        format_fingerprint(&entry.fingerprint, style),
                        entry.replaced_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
    }
    Ok(())
}

async fn trust_remove(manager: &TrustManager, target: &TargetArgs) -> Result<()> {
    let key = target.key()?;
    let scope = target.scope();
    if manager.remove(&scope, &key).await? {
        println!("✅ Removed {key} from {scope}");
    } else {
        println!("ℹ️  No record for {key} in {scope}");
    }
    Ok(())
}

async fn trust_clear(manager: &TrustManager, connection: Option<&str>, force: bool) -> Result<()> {
    let scope = Scope::from_connection_id(connection);
    let question = match manager.list(&scope).await {
        Ok(records) if records.is_empty() => {
            println!("ℹ️  {scope} holds no records");
            return Ok(());
        }
        Ok(records) => format!("Forget all {} identities in {scope}?", records.len()),
        Err(e @ (TrustError::StoreTampered { .. } | TrustError::StoreParse { .. })) => {
            println!("⚠️  {e}\n");
            format!("Discard the unreadable document of {scope}?")
        }
        Err(e) => return Err(e.into()),
    };

    if !force && !prompt_yes_no(&question).await? {
        println!("❌ Clear cancelled");
        return Ok(());
    }

    let removed = manager.clear(&scope).await?;
    println!("✅ Removed {removed} identities from {scope}");
    Ok(())
}

async fn trust_rename(manager: &TrustManager, target: &TargetArgs, nickname: Option<&str>) -> Result<()> {
    let key = target.key()?;
    let scope = target.scope();
    if !manager.rename(&scope, &key, nickname).await? {
        println!("ℹ️  No record for {key} in {scope}");
        return Ok(());
    }
    match nickname {
        Some(name) => println!("✅ {key} is now known as '{}'", name.trim()),
        None => println!("✅ Removed nickname of {key}"),
    }
    Ok(())
}

async fn trust_approve(manager: &TrustManager, target: &TargetArgs, fingerprint: &str) -> Result<()> {
    let key = target.key()?;
    let scope = target.scope();
    let fingerprint = Fingerprint::parse(fingerprint)?;
    let record = manager.approve(&scope, &key, &fingerprint).await?;
    println!("✅ Approved {} for {key} in {scope}", record.fingerprint());
    Ok(())
}

async fn trust_history(manager: &TrustManager, target: &TargetArgs, style: FingerprintStyle) -> Result<()> {
    let key = target.key()?;
    let scope = target.scope();
    let entries = manager.history(&scope, &key).await?;
    if entries.is_empty() {
        println!("No superseded identities for {key}");
        return Ok(());
    }

    println!("📜 {} superseded identities for {key} (oldest first):", entries.len());
    for entry in entries {
        println!(
            "   {}  replaced {}",
            format_fingerprint(&entry.fingerprint, style),
            entry.replaced_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn trust_verify(
    verifier: &TrustVerifier,
    target: &TargetArgs,
    fingerprint: &str,
    preset: Option<bool>,
) -> Result<()> {
    let key = target.key()?;
    let outcome = verifier
        .verify(
            target.connection.as_deref(),
            key.kind,
            &key.host,
            key.port,
            fingerprint,
        )
        .await?;

    let verdict = match outcome {
        VerificationOutcome::Accepted(accepted) => Verdict::Accepted(accepted),
        VerificationOutcome::Rejected(rejection) => Verdict::Rejected(rejection),
        VerificationOutcome::Pending(pending) => {
            describe_pending(&pending);
            let accept = match preset {
                Some(answer) => answer,
                None => prompt_yes_no("Trust this identity?").await?,
            };

            // Answer from a separate task, as a UI would
            let confirmer = {
                let verifier = verifier.clone();
                let request_id = pending.request_id();
                tokio::spawn(async move { verifier.confirm(request_id, accept).await })
            };
            let verdict = pending.outcome().await;
            confirmer.await.context("Confirmation task failed")??;
            verdict
        }
    };

    let accepted = verdict.into_result()?;
    println!(
        "✅ {} accepted ({}): {}",
        key,
        accepted.scope,
        accepted.fingerprint()
    );
    Ok(())
}

fn describe_pending(pending: &PendingVerification) {
    let style = FingerprintStyle::Colon;
    match pending.stored() {
        Some(stored) => {
            println!("⚠️  The identity of {} has CHANGED", pending.key());
            println!("   Remembered: {}", format_fingerprint(stored, style));
        }
        None => println!("🔍 First contact with {}", pending.key()),
    }
    println!("   Presented:  {}", format_fingerprint(pending.observed(), style));
    println!("   Seen at:    {}", pending.requested_at().format("%Y-%m-%d %H:%M:%S UTC"));
    println!(
        "   Policy: {} (request {}, expires in {}s)",
        pending.policy(),
        pending.request_id(),
        pending.timeout().as_secs()
    );
}

fn trust_fingerprint(kind: IdentityKind, file: &Path, style: FingerprintStyle) -> Result<()> {
    let contents = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let material = decode_material(kind, &contents)?;
    let fingerprint = fingerprint_material(kind, &material)?;
    println!("{fingerprint}");
    println!("{}", format_fingerprint(&fingerprint, style));
    Ok(())
}

/// Ask a y/N question on stdin without blocking the runtime
async fn prompt_yes_no(question: &str) -> Result<bool> {
    print!("{question} [y/N]: ");
    std::io::stdout().flush()?;

    let answer = tokio::task::spawn_blocking(|| {
        let mut input = String::new();
        std::io::stdin().read_line(&mut input).map(|_| input)
    })
    .await
    .context("Prompt task failed")??;

    let answer = answer.trim().to_lowercase();
    if answer.is_empty() {
        return Ok(false);
    }
    match answer.as_str() {
        "y" | "yes" => Ok(true),
        "n" | "no" => Ok(false),
        other => bail!("Unrecognized answer '{other}'"),
    }
}
