use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt, Snafu};

use parley_storage::{
    ErrorKind, MessageId, MessageStore, NewMessage, SqliteStorage, StorageError, UserId,
};

const ALICE: UserId = UserId::new(1);
const BOB: UserId = UserId::new(2);
const CAROL: UserId = UserId::new(3);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    SendGuards,
    ReplyScopeGuard,
    HistoryOrder,
    MarkReadIdempotent,
    ImmutableRows,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "send_guards" => Some(Self::SendGuards),
            "reply_scope_guard" => Some(Self::ReplyScopeGuard),
            "history_order" => Some(Self::HistoryOrder),
            "mark_read_idempotent" => Some(Self::MarkReadIdempotent),
            "immutable_rows" => Some(Self::ImmutableRows),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::SendGuards => "send_guards",
            Self::ReplyScopeGuard => "reply_scope_guard",
            Self::HistoryOrder => "history_order",
            Self::MarkReadIdempotent => "mark_read_idempotent",
            Self::ImmutableRows => "immutable_rows",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::SendGuards => run_send_guards(require_db_path(&args, "send_guards")?).await,
        Scenario::ReplyScopeGuard => {
            run_reply_scope_guard(require_db_path(&args, "reply_scope_guard")?).await
        }
        Scenario::HistoryOrder => run_history_order(require_db_path(&args, "history_order")?).await,
        Scenario::MarkReadIdempotent => {
            run_mark_read_idempotent(require_db_path(&args, "mark_read_idempotent")?).await
        }
        Scenario::ImmutableRows => {
            run_immutable_rows(require_db_path(&args, "immutable_rows")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let user_id = UserId::new(7);
    let message_id = MessageId::new(42);
    let user_ok = UserId::parse(&user_id.to_string()).ok() == Some(user_id);
    let message_ok = MessageId::parse(&message_id.to_string()).ok() == Some(message_id);

    println!("id_roundtrip={}", user_ok && message_ok);
    if !(user_ok && message_ok) {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip",
            scenario: "id_roundtrip",
            reason: "id display/parse roundtrip changed the value".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_input = "not-a-number";
    let rejected = UserId::parse(invalid_input).is_err() && MessageId::parse(invalid_input).is_err();

    println!("invalid_id_error={rejected}");
    if !rejected {
        return ScenarioFailedSnafu {
            stage: "scenario-id-invalid",
            scenario: "id_invalid",
            reason: "an id wrapper accepted malformed input".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_send_guards(path).await?;
        run_reply_scope_guard(path).await?;
        run_history_order(path).await?;
        run_mark_read_idempotent(path).await?;
        run_immutable_rows(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn open_fresh(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStorage> {
    reset_sqlite_files(db_path)?;
    SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-schema-init-open").await?;
    let pool = storage.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type IN ('table', 'trigger') AND name IN ('users', 'messages', 'messages_immutable_columns', 'messages_read_flag_monotonic')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let required = [
        "users",
        "messages",
        "messages_immutable_columns",
        "messages_read_flag_monotonic",
    ];
    let available: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = required.iter().all(|name| available.contains(*name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");

    if !schema_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-schema",
            scenario: "schema_init",
            reason: "expected migration tables or triggers are missing".to_string(),
        }
        .fail();
    }

    if journal_mode != "wal" {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-journal-mode",
            scenario: "schema_init",
            reason: format!("expected journal_mode=wal but was {journal_mode}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_send_guards(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-send-guards-open").await?;

    let blank = storage.send(NewMessage::new(ALICE, BOB, " \n\t ")).await;
    let to_self = storage.send(NewMessage::new(ALICE, ALICE, "hello me")).await;
    let blank_rejected = error_kind(&blank) == Some(ErrorKind::Validation);
    let self_rejected = error_kind(&to_self) == Some(ErrorKind::Validation);

    println!("blank_rejected={blank_rejected}");
    println!("self_rejected={self_rejected}");

    if !(blank_rejected && self_rejected) {
        return ScenarioFailedSnafu {
            stage: "scenario-send-guards-assert",
            scenario: "send_guards",
            reason: "malformed sends were not rejected as validation errors".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_reply_scope_guard(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-reply-scope-open").await?;
    let other_pair = storage
        .send(NewMessage::new(ALICE, CAROL, "only for carol"))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-reply-scope-seed",
        })?;

    let cross_reply = storage
        .send(NewMessage::new(BOB, ALICE, "sneaky").replying_to(other_pair.id))
        .await;
    let cross_reply_blocked = error_kind(&cross_reply) == Some(ErrorKind::NotFound);

    println!("cross_reply_blocked={cross_reply_blocked}");
    if !cross_reply_blocked {
        return ScenarioFailedSnafu {
            stage: "scenario-reply-scope-assert",
            scenario: "reply_scope_guard",
            reason: "reply to another conversation's message was accepted".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_history_order(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-history-order-open").await?;
    let mut sent = Vec::new();
    for (index, (sender, receiver)) in [(ALICE, BOB), (BOB, ALICE), (ALICE, BOB)]
        .into_iter()
        .enumerate()
    {
        let message = storage
            .send(NewMessage::new(sender, receiver, format!("message-{index}")))
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-history-order-send",
            })?;
        sent.push(message.id);
    }

    let history = storage
        .history(BOB, ALICE)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-history-order-load",
        })?;
    let loaded = history.iter().map(|message| message.id).collect::<Vec<_>>();
    let ordered = history
        .windows(2)
        .all(|pair| pair[0].order_key() < pair[1].order_key());
    let history_ok = ordered && loaded == sent;

    println!("history_ok={history_ok}");
    if !history_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-history-order-assert",
            scenario: "history_order",
            reason: format!("expected {sent:?} in order, loaded {loaded:?}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_mark_read_idempotent(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-mark-read-open").await?;
    for content in ["one", "two", "three"] {
        storage
            .send(NewMessage::new(ALICE, BOB, content))
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-mark-read-seed",
            })?;
    }

    let first = storage
        .mark_read(BOB, ALICE)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-mark-read-first",
        })?;
    let second = storage
        .mark_read(BOB, ALICE)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-mark-read-second",
        })?;
    let remaining = storage
        .unread_counts(BOB)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-mark-read-counts",
        })?
        .get(&ALICE)
        .copied()
        .unwrap_or(0);

    println!("first_marked={}", first.marked);
    println!("second_marked={}", second.marked);
    println!("remaining_unread={remaining}");

    if first.marked != 3 || second.marked != 0 || remaining != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-mark-read-assert",
            scenario: "mark_read_idempotent",
            reason: "mark_read did not converge to zero unread".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_immutable_rows(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-immutable-rows-open").await?;
    let message = storage
        .send(NewMessage::new(ALICE, BOB, "original"))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-immutable-rows-seed",
        })?;

    let edit = sqlx::query("UPDATE messages SET content = ? WHERE id = ?")
        .bind("rewritten")
        .bind(message.id.get())
        .execute(storage.pool())
        .await;
    let edit_blocked = edit.is_err();

    println!("edit_blocked={edit_blocked}");
    if !edit_blocked {
        return ScenarioFailedSnafu {
            stage: "scenario-immutable-rows-assert",
            scenario: "immutable_rows",
            reason: "message content was rewritten in place".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn error_kind<T>(result: &Result<T, StorageError>) -> Option<ErrorKind> {
    result.as_ref().err().map(StorageError::kind)
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    let base = PathBuf::from(db_path);
    remove_file_if_exists(&base, "reset-sqlite-db")?;
    remove_file_if_exists(&PathBuf::from(format!("{db_path}-wal")), "reset-sqlite-wal")?;
    remove_file_if_exists(&PathBuf::from(format!("{db_path}-shm")), "reset-sqlite-shm")?;
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
