#![doc = include_str!("../../README.md")]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

use kepler_storage::postgres::{
    self,
    import::{Importer, TokenConflictPolicy},
    queries::ChainStore,
};

use kepler_indexer::{
    buffered_task::{BufferedTask, ShrinkableQueue, TaskConfig},
    cli::{Cli, Command, GlobalArgs, IndexArgs},
    events::EventBus,
    fetcher::{
        balances::BalanceFetcher, block_fetcher::BlockFetcher,
        internal_transactions::InternalTransactionFetcher, token_balances::TokenBalanceFetcher,
        FetcherConfig,
    },
    memory::MemoryMonitor,
    rpc::{
        http::{HttpRpcClient, RpcConfig},
        ws::{subscribe_new_heads, WsConfig},
        EthereumRpc,
    },
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command() {
        Command::Index(index_args) => run_indexer(cli.args(), index_args).await,
    }
}

async fn run_indexer(global_args: GlobalArgs, args: IndexArgs) -> Result<(), anyhow::Error> {
    info!("Starting Kepler indexer");

    let pool = postgres::connect(&global_args.database_url)
        .await
        .context("connecting to the database")?;
    let importer = Importer::new(pool.clone()).with_token_conflict(
        if args.tokens_replace_on_conflict {
            TokenConflictPolicy::ReplaceAll
        } else {
            TokenConflictPolicy::Nothing
        },
    );
    let store = ChainStore::new(pool);

    let mut rpc_config =
        RpcConfig::new(Url::parse(&global_args.rpc_url).context("parsing --rpc-url")?);
    rpc_config.timeout = Duration::from_secs(args.rpc_timeout_secs);
    rpc_config.max_batch_size = args.rpc_batch_size;
    rpc_config.max_concurrency = args.rpc_concurrency;
    if let Some(trace_url) = &global_args.trace_url {
        rpc_config.method_urls.insert(
            "trace_replayTransaction".to_string(),
            Url::parse(trace_url).context("parsing --trace-url")?,
        );
    }
    let rpc: Arc<dyn EthereumRpc> = Arc::new(HttpRpcClient::new(rpc_config)?);

    let events = EventBus::new();
    let task_config = TaskConfig {
        flush_interval: Duration::from_millis(args.flush_interval_ms),
        max_batch_size: args.fetcher_batch_size,
        max_concurrency: args.fetcher_concurrency,
        init_chunk_size: args.init_chunk_size,
    };

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let (balance_queue, balance_task) = BufferedTask::spawn(
        Arc::new(BalanceFetcher::new(
            Arc::clone(&rpc),
            importer.clone(),
            store.clone(),
            task_config.init_chunk_size,
        )),
        task_config.clone(),
    );
    tasks.push(balance_task);

    let (trace_queue, trace_task) = BufferedTask::spawn(
        Arc::new(InternalTransactionFetcher::new(
            Arc::clone(&rpc),
            importer.clone(),
            store.clone(),
            balance_queue.clone(),
            task_config.init_chunk_size,
        )),
        TaskConfig {
            // traces are heavy; keep trace batches small
            max_batch_size: args.fetcher_batch_size.min(10),
            ..task_config.clone()
        },
    );
    tasks.push(trace_task);

    let (token_balance_queue, token_balance_task) = BufferedTask::spawn(
        Arc::new(TokenBalanceFetcher::new(
            Arc::clone(&rpc),
            importer.clone(),
            store.clone(),
            task_config.init_chunk_size,
        )),
        task_config.clone(),
    );
    tasks.push(token_balance_task);

    let head_nudges = match &global_args.ws_url {
        Some(ws_url) => {
            let config = WsConfig::new(Url::parse(ws_url).context("parsing --ws-url")?);
            let (rx, ws_task) = subscribe_new_heads(config);
            tasks.push(ws_task);
            Some(rx)
        }
        None => None,
    };

    let block_interval = Duration::from_millis(args.block_interval_ms);
    let fetcher = BlockFetcher::new(
        rpc,
        importer,
        store,
        events,
        FetcherConfig {
            block_interval,
            blocks_batch_size: args.blocks_batch_size,
            blocks_concurrency: args.blocks_concurrency,
            receipts_batch_size: args.receipts_batch_size,
            receipts_concurrency: args.receipts_concurrency,
            catchup_interval_floor: block_interval,
            catchup_interval_ceiling: block_interval * 32,
        },
        balance_queue.clone(),
        trace_queue.clone(),
        token_balance_queue.clone(),
    );
    tasks.push(fetcher.spawn_supervised(head_nudges));

    let queues: Vec<Arc<dyn ShrinkableQueue>> = vec![
        Arc::new(balance_queue),
        Arc::new(trace_queue),
        Arc::new(token_balance_queue),
    ];
    tasks.push(MemoryMonitor::new(args.memory_limit, queues).spawn());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            for task in &tasks {
                task.abort();
            }
            Ok(())
        }
        (result, _, _) = futures::future::select_all(&mut tasks) => {
            result.context("indexer task exited")
        }
    }
}
