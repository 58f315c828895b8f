//! Tremolo-DB CLI
//!
//! A feature-vector database management system for content-based retrieval.
//!
//! Database commands are UPPER CASE, command options are lower case:
//!
//! ```bash
//! # make a new (initially empty) database
//! tremolo-db -d test.adb -N
//!
//! # insert a feature file under a key
//! tremolo-db -d test.adb -I -f track.ftr -k track01
//!
//! # unit-norm all vectors, then run a sequence query
//! tremolo-db -d test.adb -L
//! tremolo-db -d test.adb -Q sequence -f query.ftr -l 16
//!
//! # serve the database over HTTP, query it from another host
//! tremolo-db -s 8080
//! tremolo-db -c otherhost:8080 -d test.adb -Q point -f query.ftr
//! ```
//!
//! Results go to stdout, one `key distance qpos spos` line per match.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use tremolo_db::format::read_list;
use tremolo_db::query::{self, QueryOpts, QueryType};
use tremolo_db::server::{self, QueryRequest, QueryResponse, StatusRequest, StatusResponse};
use tremolo_db::store::{BatchRequest, Database, DbStatus, InsertRequest};

#[derive(Parser)]
#[command(name = "tremolo-db")]
#[command(about = "A feature-vector database for content-based retrieval")]
#[command(version, disable_help_flag = true)]
struct Cli {
    /// print help and exit
    #[arg(short = 'H', long = "help", action = ArgAction::Help, value_parser = clap::value_parser!(bool))]
    #[allow(dead_code)]
    help: Option<bool>,

    /// level of detail of operational information (0-10)
    #[arg(short = 'v', long = "verbosity", default_value_t = 1)]
    verbosity: i64,

    /// database file required by database commands
    #[arg(short = 'd', long = "database")]
    database: Option<PathBuf>,

    // ---- commands (mutually exclusive, at most one per invocation) ----
    /// make a new (initially empty) database
    #[arg(short = 'N', long = "NEW")]
    new: bool,

    /// output database information to stdout
    #[arg(short = 'S', long = "STATUS")]
    status: bool,

    /// output all entries: key size
    #[arg(short = 'D', long = "DUMP")]
    dump: bool,

    /// unit norm vectors and norm all future inserts
    #[arg(short = 'L', long = "L2NORM")]
    l2norm: bool,

    /// add feature vectors to an existing database
    #[arg(short = 'I', long = "INSERT")]
    insert: bool,

    /// replace inserted vectors associated with key (reserved)
    #[arg(short = 'U', long = "UPDATE")]
    update: bool,

    /// add feature vectors named in a --featureList file
    #[arg(short = 'B', long = "BATCHINSERT")]
    batchinsert: bool,

    /// content-based search: point, segment or sequence
    #[arg(short = 'Q', long = "QUERY", value_name = "searchtype")]
    query: Option<String>,

    /// run as standalone web service on named port
    #[arg(short = 's', long = "SERVER", value_name = "port")]
    server: Option<i64>,

    /// run as a client using named host service
    #[arg(short = 'c', long = "client", value_name = "hostname:port")]
    client: Option<String>,

    // ---- insert inputs ----
    /// binary feature vector file {u32 dim:f64[][dim]:eof}
    #[arg(short = 'f', long = "features")]
    features: Option<PathBuf>,

    /// list of time points (ascii) for feature vectors
    #[arg(short = 't', long = "times")]
    times: Option<PathBuf>,

    /// unique identifier associated with features
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    // ---- batch inputs ----
    /// text file containing feature vector files to process
    #[arg(short = 'F', long = "featureList")]
    feature_list: Option<PathBuf>,

    /// text file containing a times file per featureList entry
    #[arg(short = 'T', long = "timesList")]
    times_list: Option<PathBuf>,

    /// text file containing a key per featureList entry
    #[arg(short = 'K', long = "keyList")]
    key_list: Option<PathBuf>,

    // ---- query knobs ----
    /// ordinal position of query start point in --features file
    #[arg(short = 'p', long = "qpoint", default_value_t = 0)]
    qpoint: u32,

    /// iterate through all query vectors; overrides --qpoint
    #[arg(short = 'e', long = "exhaustive")]
    exhaustive: bool,

    /// number of point nearest neighbours used in retrieval
    #[arg(short = 'n', long = "pointnn", default_value_t = 10)]
    pointnn: u32,

    /// maximum length of the result list
    #[arg(short = 'r', long = "resultlength", default_value_t = 10)]
    resultlength: u32,

    /// length of sequences for sequence search
    #[arg(short = 'l', long = "sequencelength", default_value_t = 16)]
    sequencelength: u32,

    /// hop size of sequence window for sequence search
    #[arg(short = 'h', long = "sequencehop", default_value_t = 1)]
    sequencehop: u32,

    /// radius search (reserved)
    #[arg(short = 'R', long = "radius", default_value_t = 1.0)]
    #[allow(dead_code)]
    radius: f64,

    /// time expand factor of result length (reserved)
    #[arg(short = 'x', long = "expandfactor", default_value_t = 1.1)]
    #[allow(dead_code)]
    expandfactor: f64,

    /// rotate query vectors (reserved)
    #[arg(short = 'o', long = "rotate")]
    #[allow(dead_code)]
    rotate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut verbosity = cli.verbosity;
    if !(0..=10).contains(&verbosity) {
        eprintln!("Warning: verbosity out of range, setting to 1");
        verbosity = 1;
    }
    let level = match verbosity {
        0 => "error",
        1 => "info",
        2..=4 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let selected = [
        cli.new,
        cli.status,
        cli.dump,
        cli.l2norm,
        cli.insert,
        cli.update,
        cli.batchinsert,
        cli.query.is_some(),
        cli.server.is_some(),
    ]
    .iter()
    .filter(|&&on| on)
    .count();
    if selected == 0 {
        bail!("no command found (one of -N -S -D -L -I -B -Q -s is required)");
    }
    if selected > 1 {
        bail!("database commands are mutually exclusive: give at most one");
    }

    if let Some(port) = cli.server {
        if !(100..=100_000).contains(&port) {
            bail!("port out of range: 100 <= port <= 100000");
        }
        let port = u16::try_from(port).context("port does not fit a TCP port number")?;
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        server::serve(addr).await?;
        return Ok(());
    }

    let db_path = cli
        .database
        .as_ref()
        .context("a database is required (-d)")?;

    if cli.new {
        Database::create(db_path)?;
        return Ok(());
    }

    if cli.status {
        if let Some(hostport) = &cli.client {
            return ws_status(hostport, db_path).await;
        }
        let db = Database::open(db_path)?;
        print_status(&db.status(cli.sequencelength as usize));
        return Ok(());
    }

    if cli.dump {
        let db = Database::open(db_path)?;
        for (key, size) in db.dump() {
            println!("{key} {size}");
        }
        print_status(&db.status(cli.sequencelength as usize));
        return Ok(());
    }

    if cli.l2norm {
        let mut db = Database::open(db_path)?;
        db.l2norm()?;
        return Ok(());
    }

    if cli.insert {
        let features = cli.features.as_ref().context("INSERT requires --features")?;
        let mut db = Database::open(db_path)?;
        db.insert(&InsertRequest {
            features,
            key: cli.key.as_deref(),
            times: cli.times.as_deref(),
        })?;
        print_status(&db.status(cli.sequencelength as usize));
        return Ok(());
    }

    if cli.batchinsert {
        let feature_list = cli
            .feature_list
            .as_ref()
            .context("BATCHINSERT requires --featureList")?;
        let mut db = Database::open(db_path)?;
        db.batch_insert(&BatchRequest {
            feature_list,
            key_list: cli.key_list.as_deref(),
            times_list: cli.times_list.as_deref(),
        })?;
        print_status(&db.status(cli.sequencelength as usize));
        return Ok(());
    }

    if cli.update {
        bail!("UPDATE is reserved and not implemented");
    }

    if let Some(query_type) = &cli.query {
        let features = cli.features.as_ref().context("QUERY requires --features")?;
        if let Some(hostport) = &cli.client {
            return ws_query(hostport, db_path, features, query_type, &cli).await;
        }

        let query_type: QueryType = query_type.parse()?;
        let opts = QueryOpts {
            qpoint: (!cli.exhaustive).then_some(cli.qpoint as usize),
            point_nn: cli.pointnn as usize,
            seg_nn: cli.resultlength as usize,
            seq_len: cli.sequencelength as usize,
            seq_hop: cli.sequencehop as usize,
        };
        let key_list = match &cli.key_list {
            Some(path) => Some(read_list(path)?),
            None => None,
        };

        let db = Database::open(db_path)?;
        let hits = query::query(
            &db,
            query_type,
            features,
            &opts,
            cli.times.as_deref(),
            key_list.as_deref(),
        )?;
        for hit in hits {
            println!("{} {} {} {}", hit.key, hit.distance, hit.qpos, hit.spos);
        }
        return Ok(());
    }

    bail!("unrecognized command");
}

fn print_status(status: &DbStatus) {
    println!("num files:{}", status.num_files);
    println!("data dim:{}", status.dim);
    if status.dim > 0 {
        println!("total vectors:{}", status.total_vectors);
        println!("vectors available:{}", status.vectors_available);
    }
    println!(
        "total bytes:{} ({:.4}%)",
        status.total_bytes, status.used_percent
    );
    println!(
        "bytes available:{} ({:.4}%)",
        status.bytes_available, status.available_percent
    );
    println!("flags:{}", status.flags);
    println!(
        "null count: {} small sequence count {}",
        status.null_count, status.short_count
    );
}

async fn ws_status(hostport: &str, db_path: &std::path::Path) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://{hostport}/status");
    let request = StatusRequest {
        database: db_path.to_string_lossy().into_owned(),
    };

    let response = client.post(&url).json(&request).send().await?;
    if !response.status().is_success() {
        let error: serde_json::Value = response.json().await?;
        bail!("server error: {error}");
    }

    let status: StatusResponse = response.json().await?;
    println!("num files:{}", status.num_files);
    println!("data dim:{}", status.dim);
    println!("total vectors:{}", status.total_vectors);
    println!("total bytes:{}", status.total_bytes);
    println!("flags:{}", status.flags);
    Ok(())
}

async fn ws_query(
    hostport: &str,
    db_path: &std::path::Path,
    features: &std::path::Path,
    query_type: &str,
    cli: &Cli,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://{hostport}/query");
    let request = QueryRequest {
        database: db_path.to_string_lossy().into_owned(),
        features: features.to_string_lossy().into_owned(),
        query_type: query_type.to_string(),
        key_list: cli
            .key_list
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        times: cli.times.as_ref().map(|p| p.to_string_lossy().into_owned()),
        qpoint: cli.qpoint,
        point_nn: cli.pointnn,
        seg_nn: cli.resultlength,
        seq_len: cli.sequencelength,
    };

    let response = client.post(&url).json(&request).send().await?;
    if !response.status().is_success() {
        let error: serde_json::Value = response.json().await?;
        bail!("server error: {error}");
    }

    let result: QueryResponse = response.json().await?;
    for i in 0..result.rlist.len() {
        println!(
            "{} {} {} {}",
            result.rlist[i], result.dist[i], result.qpos[i], result.spos[i]
        );
    }
    Ok(())
}
