use {
    c9p::{Mode, OpenFlags, SessionOptions, connect},
    clap::{Parser, Subcommand},
    std::time::Duration,
};

#[derive(Debug, Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// User name for the attach
    #[arg(long, default_value = "root")]
    uname: String,

    /// File tree to attach to
    #[arg(long, default_value = "/")]
    aname: String,

    /// Numeric uid for the attach
    #[arg(long, default_value_t = 0)]
    uid: u32,

    /// Group id used when creating files and directories
    #[arg(long, default_value_t = 0)]
    gid: u32,

    /// Maximum message size to propose
    #[arg(long, default_value_t = c9p::DEFAULT_MSIZE)]
    msize: u32,

    /// Per-transaction timeout in seconds (0 waits indefinitely)
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List a directory
    Ls { path: String },
    /// Print the attributes of a path
    Stat { path: String },
    /// Print the contents of a file
    Cat { path: String },
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(default_value = "755")]
        mode: String,
    },
    /// Create an empty file
    Touch {
        path: String,
        #[arg(default_value = "644")]
        mode: String,
    },
    /// Change owner and group
    Chown { path: String, uid: u32, gid: u32 },
    /// Change permission bits
    Chmod { path: String, mode: String },
    /// Read an extended attribute
    Xattrget { path: String, name: String },
    /// Set (or, with an empty value, remove) an extended attribute
    Xattrset {
        path: String,
        name: String,
        value: String,
    },
    /// List extended attribute names
    Xattrlist { path: String },
    /// Remove a single entry
    Rm { path: String },
    /// Remove a path and everything beneath it
    Rmrf { path: String },
}

fn parse_mode(s: &str) -> c9p::Result<Mode> {
    let bits = u32::from_str_radix(s, 8)
        .map_err(|_| c9p::Error::Io(io_err("not an octal permission mask")))?;
    Mode::from_bits(bits).ok_or_else(|| c9p::Error::Io(io_err("bits outside 0o7777")))
}

fn io_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_owned())
}

async fn npsh_main(cli: Cli) -> c9p::Result<i32> {
    let opts = SessionOptions {
        uname: cli.uname,
        aname: cli.aname,
        uid: cli.uid,
        gid: cli.gid,
        msize: cli.msize,
        timeout: match cli.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
    };

    let mut session = connect(&cli.address, opts).await?;

    let result = run_command(&session, cli.command).await;
    session.close().await?;
    result.and(Ok(0))
}

async fn run_command(session: &c9p::Session, command: Command) -> c9p::Result<()> {
    match command {
        Command::Ls { path } => {
            let mut fid = session.walk(&path).await?;
            let entries = fid.dirents().await?;
            fid.clunk().await?;
            for entry in entries {
                let marker = if entry.qid.is_dir() { "/" } else { "" };
                println!("{}{}", entry.name, marker);
            }
        }
        Command::Stat { path } => {
            let stat = session.stat(&path).await?;
            println!(
                "mode {:o} uid {} gid {} size {} mtime {}",
                stat.mode, stat.uid, stat.gid, stat.size, stat.mtime.sec
            );
        }
        Command::Cat { path } => {
            let mut fid = session.open(&path, OpenFlags::RDONLY, Mode::empty()).await?;
            let res = fid.read_to_end(0).await;
            fid.clunk().await?;
            use std::io::Write;
            std::io::stdout().write_all(&res?)?;
        }
        Command::Mkdir { path, mode } => {
            session.mkdir(&path, parse_mode(&mode)?).await?;
        }
        Command::Touch { path, mode } => {
            let mut fid = session
                .open(&path, OpenFlags::RDWR | OpenFlags::CREATE, parse_mode(&mode)?)
                .await?;
            fid.clunk().await?;
        }
        Command::Chown { path, uid, gid } => {
            let mut fid = session.walk(&path).await?;
            let res = fid.chown(uid, gid).await;
            fid.clunk().await?;
            res?;
        }
        Command::Chmod { path, mode } => {
            let mode = parse_mode(&mode)?;
            let mut fid = session.walk(&path).await?;
            let res = fid.chmod(mode).await;
            fid.clunk().await?;
            res?;
        }
        Command::Xattrget { path, name } => {
            let mut fid = session.walk(&path).await?;
            let res = fid.xattrget(&name, 64 * 1024).await;
            fid.clunk().await?;
            println!("{}", String::from_utf8_lossy(&res?));
        }
        Command::Xattrset { path, name, value } => {
            let mut fid = session.walk(&path).await?;
            let res = fid.xattrset(&name, value.as_bytes()).await;
            fid.clunk().await?;
            let wrote = res?;
            if wrote != value.len() as u64 {
                return Err(c9p::Error::IncompleteWrite {
                    wrote,
                    expected: value.len() as u64,
                });
            }
        }
        Command::Xattrlist { path } => {
            let mut fid = session.walk(&path).await?;
            let res = fid.xattrlist(64 * 1024).await;
            fid.clunk().await?;
            for name in res? {
                println!("{}", name);
            }
        }
        Command::Rm { path } => {
            session.rm(&path).await?;
        }
        Command::Rmrf { path } => {
            if let Err(e) = session.rmrf(&path).await {
                log::error!("{}", e);
                return Err(e.first);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = npsh_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
