//! End-to-end pipeline tests: a real pump server on a loopback listener,
//! membership through the in-process KV store, and a drainer replaying
//! the merged stream into a memory sink.

use std::sync::Arc;
use std::time::Duration;

use prost::Message;

use sluice_drainer::checkpoint::{
    CheckPoint, CheckpointRecord, CheckpointStatus, FileCheckpoint,
};
use sluice_drainer::sync::MemorySyncer;
use sluice_drainer::{Drainer, DrainerConfig};
use sluice_loader::DmlType;
use sluice_proto::pump::pump_client::PumpClient;
use sluice_proto::pump::WriteBinlogReq;
use sluice_proto::{
    Binlog, BinlogType, ColumnInfo, ColumnValue, DdlJob, FieldType, IndexInfo, JobState, JobType,
    MutationType, PrewriteValue, RowValue, SchemaInfo, TableInfo, TableMutation,
};
use sluice_pump::{ClockOracle, PumpConfig, Server};
use sluice_registry::{MemKvStore, NodeRegistry};

const CLUSTER: u64 = 9;

struct TestCluster {
    registry: Arc<NodeRegistry>,
    pump: Arc<Server>,
    pump_task: tokio::task::JoinHandle<Result<(), sluice_pump::PumpError>>,
    client: PumpClient<tonic::transport::Channel>,
}

async fn start_cluster(data_dir: &std::path::Path) -> TestCluster {
    let kv = Arc::new(MemKvStore::new());
    let registry = Arc::new(NodeRegistry::new(kv, Duration::from_secs(10)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cfg = PumpConfig {
        listen_addr: addr.to_string(),
        data_dir: data_dir.to_path_buf(),
        node_id: "pump-0".to_string(),
        // Keep the log quiet: these tests stamp their own small commit
        // timestamps, which a wall-clock heartbeat would overtake.
        heartbeat_interval_secs: 3600,
        ..PumpConfig::default()
    };
    let pump = Arc::new(
        Server::new(cfg, Arc::new(ClockOracle::new()), Some(Arc::clone(&registry))).unwrap(),
    );

    let run_pump = Arc::clone(&pump);
    let pump_task = tokio::spawn(async move { run_pump.run(listener).await });

    let client = connect(addr).await;
    TestCluster {
        registry,
        pump,
        pump_task,
        client,
    }
}

async fn connect(addr: std::net::SocketAddr) -> PumpClient<tonic::transport::Channel> {
    for _ in 0..50 {
        if let Ok(client) = PumpClient::connect(format!("http://{addr}")).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("pump server never came up");
}

fn column(id: i64, name: &str, pk: bool) -> ColumnInfo {
    ColumnInfo {
        id,
        name: name.to_string(),
        field_type: FieldType::Longlong as i32,
        primary_key: pk,
        default_value: None,
    }
}

fn ddl_binlog(job_id: i64, commit_ts: i64, query: &str, job: DdlJob) -> Binlog {
    Binlog {
        tp: BinlogType::Ddl as i32,
        commit_ts,
        ddl_query: query.to_string(),
        ddl_job_id: job_id,
        ddl_job: Some(job),
        ..Binlog::default()
    }
}

fn schema_job() -> DdlJob {
    DdlJob {
        id: 1,
        tp: JobType::CreateSchema as i32,
        state: JobState::Done as i32,
        schema_id: 10,
        table_id: 0,
        schema_info: Some(SchemaInfo {
            id: 10,
            name: "orders".to_string(),
        }),
        table_info: None,
    }
}

fn table_job() -> DdlJob {
    DdlJob {
        id: 2,
        tp: JobType::CreateTable as i32,
        state: JobState::Done as i32,
        schema_id: 10,
        table_id: 100,
        schema_info: Some(SchemaInfo {
            id: 10,
            name: "orders".to_string(),
        }),
        table_info: Some(TableInfo {
            id: 100,
            name: "uindex".to_string(),
            columns: vec![column(1, "id", true), column(2, "a1", false)],
            indices: vec![IndexInfo {
                name: "a1_uk".to_string(),
                columns: vec!["a1".to_string()],
                unique: true,
                primary: false,
            }],
            pk_is_handle: true,
        }),
    }
}

/// The catalog snapshot a restarting drainer is constructed with.
fn schema_history() -> Vec<DdlJob> {
    vec![schema_job(), table_job()]
}

fn create_schema_binlog(commit_ts: i64) -> Binlog {
    ddl_binlog(1, commit_ts, "CREATE DATABASE orders", schema_job())
}

fn create_table_binlog(commit_ts: i64) -> Binlog {
    ddl_binlog(
        2,
        commit_ts,
        "CREATE TABLE uindex (id BIGINT PRIMARY KEY, a1 BIGINT UNIQUE)",
        table_job(),
    )
}

fn insert_prewrite(start_ts: i64, id: i64, a1: i64) -> Binlog {
    let row = RowValue {
        handle: Some(id),
        columns: vec![ColumnValue {
            column_id: 2,
            int64_value: Some(a1),
            ..ColumnValue::default()
        }],
    };
    let value = PrewriteValue {
        mutations: vec![TableMutation {
            schema_id: 10,
            table_id: 100,
            tp: MutationType::Insert as i32,
            row: row.encode_to_vec(),
            change_row: vec![],
        }],
    };
    Binlog {
        tp: BinlogType::Prewrite as i32,
        start_ts,
        prewrite_key: format!("row-{id}").into_bytes(),
        prewrite_value: value.encode_to_vec(),
        ..Binlog::default()
    }
}

fn commit_binlog(start_ts: i64, commit_ts: i64) -> Binlog {
    Binlog {
        tp: BinlogType::Commit as i32,
        start_ts,
        commit_ts,
        ..Binlog::default()
    }
}

async fn write(client: &mut PumpClient<tonic::transport::Channel>, binlog: Binlog) {
    let resp = client
        .write_binlog(WriteBinlogReq {
            cluster_id: CLUSTER,
            payload: binlog.encode_to_vec(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(resp.errmsg.is_empty(), "{}", resp.errmsg);
}

fn drainer_config(data_dir: &std::path::Path) -> DrainerConfig {
    DrainerConfig {
        data_dir: data_dir.to_path_buf(),
        cluster_id: CLUSTER,
        ..DrainerConfig::default()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pipeline_replays_committed_transactions_in_order() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut cluster = start_cluster(&tmp.path().join("pump")).await;

    write(&mut cluster.client, create_schema_binlog(100)).await;
    write(&mut cluster.client, create_table_binlog(200)).await;
    write(&mut cluster.client, insert_prewrite(1, 1, 10)).await;
    write(&mut cluster.client, commit_binlog(1, 300)).await;
    // An aborted transaction: its prewrite must never reach downstream.
    write(&mut cluster.client, insert_prewrite(5, 99, 990)).await;
    write(
        &mut cluster.client,
        Binlog {
            tp: BinlogType::Rollback as i32,
            start_ts: 5,
            commit_ts: 350,
            ..Binlog::default()
        },
    )
    .await;
    write(&mut cluster.client, insert_prewrite(2, 2, 20)).await;
    write(&mut cluster.client, commit_binlog(2, 400)).await;

    let drainer_dir = tmp.path().join("drainer");
    std::fs::create_dir_all(&drainer_dir).unwrap();
    let checkpoint = Arc::new(FileCheckpoint::new(drainer_dir.join("savepoint")));
    let syncer = MemorySyncer::new();
    let applied = syncer.applied();

    let drainer = Drainer::new(
        drainer_config(&drainer_dir),
        Arc::clone(&cluster.registry),
        Arc::clone(&checkpoint) as Arc<dyn CheckPoint>,
        Box::new(syncer),
        Vec::new(),
    )
    .unwrap();
    let token = drainer.token();
    let drainer_task = tokio::spawn(drainer.run());

    wait_for("all four transactions", || applied.lock().len() >= 4).await;

    {
        let txns = applied.lock();
        let commit_order: Vec<i64> = txns.iter().map(|t| t.commit_ts).collect();
        assert_eq!(commit_order, vec![100, 200, 300, 400]);
        assert!(txns[0].is_ddl());
        assert!(txns[1].is_ddl());

        let insert = &txns[2].dmls[0];
        assert_eq!(insert.tp, DmlType::Insert);
        assert_eq!(insert.database, "orders");
        assert_eq!(insert.table, "uindex");
        assert_eq!(
            insert.values.get("id"),
            Some(&sluice_loader::Value::I64(1))
        );
        assert_eq!(
            insert.values.get("a1"),
            Some(&sluice_loader::Value::I64(10))
        );
        // The aborted start_ts=5 prewrite is nowhere to be seen.
        assert!(txns.iter().all(|t| t
            .dmls
            .iter()
            .all(|d| d.values.get("id") != Some(&sluice_loader::Value::I64(99)))));
    }

    // The running checkpoint catches up to the last acknowledged commit.
    wait_for("checkpoint to advance", || {
        futures_block(checkpoint.load()).map(|r| r.commit_ts) == Ok(400)
    })
    .await;

    // Clean shutdown downgrades the status to Normal and records the
    // applied frontier of the pump.
    token.cancel();
    drainer_task.await.unwrap().unwrap();
    let record = futures_block(checkpoint.load()).unwrap();
    assert_eq!(record.commit_ts, 400);
    assert_eq!(record.status, CheckpointStatus::Normal);
    let frontier = record.positions.get("pump-0").expect("pump position");
    assert!(frontier.offset > 0);

    // Restart with the catalog snapshot: nothing at or below the
    // checkpoint is re-applied, new transactions flow.
    let syncer = MemorySyncer::new();
    let applied_after = syncer.applied();
    let drainer = Drainer::new(
        drainer_config(&drainer_dir),
        Arc::clone(&cluster.registry),
        Arc::clone(&checkpoint) as Arc<dyn CheckPoint>,
        Box::new(syncer),
        schema_history(),
    )
    .unwrap();
    let token = drainer.token();
    let drainer_task = tokio::spawn(drainer.run());

    write(&mut cluster.client, insert_prewrite(3, 3, 30)).await;
    write(&mut cluster.client, commit_binlog(3, 500)).await;

    wait_for("the post-restart transaction", || {
        applied_after.lock().iter().any(|t| t.commit_ts == 500)
    })
    .await;
    {
        let txns = applied_after.lock();
        assert!(
            txns.iter().all(|t| t.commit_ts > 400),
            "re-applied old txns: {:?}",
            txns.iter().map(|t| t.commit_ts).collect::<Vec<_>>()
        );
    }

    token.cancel();
    drainer_task.await.unwrap().unwrap();

    cluster.pump.shutdown();
    drop(cluster.client);
    cluster.pump_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_after_crash_skips_checkpointed_transactions() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut cluster = start_cluster(&tmp.path().join("pump")).await;

    write(&mut cluster.client, create_schema_binlog(100)).await;
    write(&mut cluster.client, create_table_binlog(200)).await;
    write(&mut cluster.client, insert_prewrite(1, 1, 10)).await;
    write(&mut cluster.client, commit_binlog(1, 300)).await;
    write(&mut cluster.client, insert_prewrite(2, 2, 20)).await;
    write(&mut cluster.client, commit_binlog(2, 400)).await;

    // A crash left the checkpoint mid-flight at 300.
    let drainer_dir = tmp.path().join("drainer");
    std::fs::create_dir_all(&drainer_dir).unwrap();
    let checkpoint = Arc::new(FileCheckpoint::new(drainer_dir.join("savepoint")));
    checkpoint
        .save(&CheckpointRecord::new(300, CheckpointStatus::Running))
        .await
        .unwrap();

    let syncer = MemorySyncer::new();
    let applied = syncer.applied();
    let drainer = Drainer::new(
        drainer_config(&drainer_dir),
        Arc::clone(&cluster.registry),
        Arc::clone(&checkpoint) as Arc<dyn CheckPoint>,
        Box::new(syncer),
        Vec::new(),
    )
    .unwrap();
    let token = drainer.token();
    let drainer_task = tokio::spawn(drainer.run());

    wait_for("the unacknowledged transaction", || {
        applied.lock().iter().any(|t| t.commit_ts == 400)
    })
    .await;
    {
        let txns = applied.lock();
        // At most the txns after the checkpoint, never the earlier ones.
        assert!(txns.iter().all(|t| t.commit_ts > 300));
    }

    token.cancel();
    drainer_task.await.unwrap().unwrap();
    cluster.pump.shutdown();
    drop(cluster.client);
    cluster.pump_task.await.unwrap().unwrap();
}

/// Blocks on a small future from a sync closure inside `wait_for`.
fn futures_block<F, T>(fut: F) -> Result<T, String>
where
    F: std::future::Future<Output = Result<T, sluice_drainer::checkpoint::CheckpointError>>,
{
    tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current()
            .block_on(fut)
            .map_err(|e| e.to_string())
    })
}
