// =============================================================================
// keyctl-admin — non-interactive RPC driver for keyctld
// =============================================================================
// One subcommand per RPC verb. Talks over the Unix socket by default (the
// expected deployment: run as root alongside the daemon) or over TLS with
// --host/--port/--password. This is NOT the interactive setup/mount CLI —
// no prompts, no LUKS shell-outs, no sysconfig editing: a one-shot RPC
// driver with a printed result per call.
// =============================================================================

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use keyctld::client::{Client, ClientConfig};
use keyctld::record::CommandContent;
use keyctld::rpc::*;
use keyctld::store::RecordStore;

#[derive(Parser)]
#[command(name = "keyctl-admin")]
#[command(about = "Non-interactive RPC driver for keyctld")]
struct Args {
    /// Path to keyctld's Unix admin socket. Ignored when --host is given.
    #[arg(long, default_value = "/run/keyctld.sock")]
    socket: PathBuf,

    /// Remote host:port — switches from the Unix socket to TLS.
    #[arg(long)]
    host: Option<String>,

    #[arg(long, default_value_t = 3737)]
    port: u16,

    /// TLS server name to validate against (defaults to --host).
    #[arg(long)]
    tls_server_name: Option<String>,

    /// Path to a CA bundle to validate the server cert against.
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Admin password, required for password-gated verbs over TLS.
    #[arg(long, default_value = "")]
    password: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Ping,
    GetSalt,
    CreateKey {
        #[arg(long)]
        id: String,
        #[arg(long)]
        mount_point: String,
        #[arg(long, default_value = "")]
        mount_options: String,
        #[arg(long)]
        max_active: u32,
        #[arg(long)]
        alive_interval_sec: i64,
        #[arg(long)]
        alive_count: u32,
        #[arg(long)]
        use_kmip: bool,
        #[arg(long, default_value_t = 256)]
        key_len_bits: u32,
    },
    AutoRetrieve {
        #[arg(long, num_args = 1..)]
        uuid: Vec<String>,
        #[arg(long)]
        hostname: String,
        /// Caps how many of `uuid` are attempted in this call; 0 is unlimited.
        #[arg(long, default_value_t = 0)]
        max_per_request: u32,
    },
    ManualRetrieve {
        #[arg(long)]
        uuid: String,
        #[arg(long)]
        hostname: String,
    },
    ReportAlive {
        #[arg(long, num_args = 1..)]
        uuid: Vec<String>,
        #[arg(long)]
        hostname: String,
    },
    EraseKey {
        #[arg(long)]
        uuid: String,
    },
    PollCommand {
        #[arg(long)]
        uuid: String,
    },
    SaveCommandResult {
        #[arg(long)]
        uuid: String,
        #[arg(long)]
        result: String,
    },
    ReloadRecord {
        #[arg(long)]
        uuid: String,
    },
    /// Enqueues a `PendingCommand` for a holder IP by editing the record
    /// file directly (§4.3/§4.5) — the daemon is not in the write path, so
    /// this works even against a record the daemon doesn't currently have
    /// loaded. Pass --reload to also ask the running daemon to pick it up.
    SendCommand {
        #[arg(long)]
        keydb_dir: PathBuf,
        #[arg(long)]
        uuid: String,
        #[arg(long)]
        target_ip: IpAddr,
        #[arg(long, value_enum)]
        content: CommandKindArg,
        #[arg(long, default_value_t = 600)]
        validity_sec: i64,
        #[arg(long)]
        reload: bool,
    },
    Shutdown {
        /// Admin-challenge token printed to the daemon's log at startup.
        #[arg(long)]
        admin_challenge: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CommandKindArg {
    Mount,
    Umount,
}

impl From<CommandKindArg> for CommandContent {
    fn from(k: CommandKindArg) -> Self {
        match k {
            CommandKindArg::Mount => CommandContent::Mount,
            CommandKindArg::Umount => CommandContent::Umount,
        }
    }
}

fn build_client(args: &Args) -> Client {
    match &args.host {
        None => Client::new(ClientConfig::unix(args.socket.clone())),
        Some(host) => {
            let server_name = args.tls_server_name.clone().unwrap_or_else(|| host.clone());
            let addr: SocketAddr = format!("{host}:{}", args.port)
                .to_socket_addrs()
                .unwrap_or_else(|e| panic!("failed to resolve {host}:{}: {e}", args.port))
                .next()
                .unwrap_or_else(|| panic!("no address found for {host}:{}", args.port));
            Client::new(ClientConfig::tls(addr, server_name, args.tls_ca.clone()))
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let password = args.password.clone();
    let client = build_client(&args);

    let result = run(&client, password, args.command).await;
    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("keyctl-admin: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(client: &Client, password: String, command: Command) -> Result<(), keyctld::error::Error> {
    match command {
        Command::Ping => {
            client.ping(PingRequest { password }).await?;
            println!("ok");
        }
        Command::GetSalt => {
            let resp = client.get_salt().await?;
            println!("{}", hex::encode(resp.salt));
        }
        Command::CreateKey { id, mount_point, mount_options, max_active, alive_interval_sec, alive_count, use_kmip, key_len_bits } => {
            let resp = client
                .create_key(CreateKeyRequest {
                    password,
                    id,
                    mount_point,
                    mount_options,
                    max_active,
                    alive_interval_sec,
                    alive_count,
                    use_kmip,
                    key_len_bits,
                })
                .await?;
            println!("{}", resp.uuid);
        }
        Command::AutoRetrieve { uuid, hostname, max_per_request } => {
            let resp = client.auto_retrieve_key(AutoRetrieveKeyRequest { uuids: uuid, hostname, max_per_request }).await?;
            for (uuid, material) in &resp.granted {
                println!("{uuid} {}", hex::encode(material));
            }
            if !resp.rejected_uuids.is_empty() {
                eprintln!("rejected: {}", resp.rejected_uuids.join(","));
                std::process::exit(2);
            }
        }
        Command::ManualRetrieve { uuid, hostname } => {
            let resp = client.manual_retrieve_key(ManualRetrieveKeyRequest { password, uuid, hostname }).await?;
            println!("{}", hex::encode(resp.key_material));
        }
        Command::ReportAlive { uuid, hostname } => {
            let resp = client.report_alive(ReportAliveRequest { uuids: uuid, hostname }).await?;
            if resp.rejected_uuids.is_empty() {
                println!("ok");
            } else {
                println!("rejected: {}", resp.rejected_uuids.join(","));
            }
        }
        Command::EraseKey { uuid } => {
            client.erase_key(EraseKeyRequest { password, uuid }).await?;
            println!("ok");
        }
        Command::PollCommand { uuid } => {
            let resp = client.poll_command(PollCommandRequest { uuid }).await?;
            match resp.command {
                Some(CommandContent::Mount) => println!("mount"),
                Some(CommandContent::Umount) => println!("umount"),
                None => println!("none"),
            }
        }
        Command::SaveCommandResult { uuid, result } => {
            let resp = client.save_command_result(SaveCommandResultRequest { uuid, result }).await?;
            println!("{}", if resp.accepted { "accepted" } else { "no matching command" });
        }
        Command::ReloadRecord { uuid } => {
            client.reload_record(ReloadRecordRequest { password, uuid }).await?;
            println!("ok");
        }
        Command::SendCommand { keydb_dir, uuid, target_ip, content, validity_sec, reload } => {
            let mut rec = RecordStore::open_one(&keydb_dir, &uuid).await?;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system clock is before the unix epoch")
                .as_secs() as i64;
            rec.send_command(target_ip, content.into(), now, validity_sec);
            RecordStore::write_one(&keydb_dir, &rec).await?;
            if reload {
                client.reload_record(ReloadRecordRequest { password, uuid }).await?;
            }
            println!("ok");
        }
        Command::Shutdown { admin_challenge } => {
            client.shutdown(ShutdownRequest { admin_challenge }).await?;
            println!("ok");
        }
    }
    Ok(())
}
