//! Server-to-server tests against a live Redis
//!
//! Run with `cargo test -- --ignored` and a server on `KVGUARD_REDIS_HOST`
//! (default `127.0.0.1:6379`).

mod common;

#[cfg(test)]
mod tests {
    use super::common::{init_tracing, setup_s2s_config};
    use kvguard::{FixedCommand, Pool, Reply, ServerDescriptor, TransactionOutcome};
    use uuid::Uuid;

    fn unique(prefix: &str) -> String {
        format!("kvguard-test:{prefix}:{}", Uuid::new_v4().simple())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_s2s_kv_and_hash_take() {
        init_tracing();
        let pool = Pool::connect(setup_s2s_config()).await.unwrap();
        assert_eq!(pool.len(), 1);

        let key = unique("kv");
        pool.kv().set_ex(&key, "v", 30).await.unwrap();
        assert_eq!(pool.kv().get_string(&key).await.unwrap(), Some("v".into()));
        assert!(pool.kv().ttl(&key).await.unwrap() > 0);

        let table = unique("table");
        pool.hash().hset(&table, "f", "x").await.unwrap();
        assert_eq!(pool.hash().hpop(&table, "f").await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(pool.hash().hpop(&table, "f").await.unwrap(), None);

        pool.kv().del(&[key.as_str()]).await.unwrap();
        pool.close();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_s2s_lock_queue_transaction() {
        init_tracing();
        let pool = Pool::connect(setup_s2s_config()).await.unwrap();

        let res = unique("lock");
        pool.lock().lock(&res, 3, 10).await.unwrap();
        assert!(pool.lock().lock(&res, 1, 10).await.is_err());
        pool.lock().unlock(&res).await.unwrap();

        let token = pool.lock().lock_with_token(&res, 1, 10).await.unwrap();
        assert!(pool.lock().unlock_with_token(&token).await.unwrap());

        let queue = unique("queue");
        pool.queue().enqueue(&queue, "k1", b"p1").await.unwrap();
        pool.queue().enqueue(&queue, "k1", b"p2").await.unwrap();
        let entry = pool.queue().dequeue(&queue).await.unwrap().unwrap();
        assert_eq!(entry.payload, Some(b"p2".to_vec()));
        assert!(pool.queue().dequeue(&queue).await.unwrap().is_none());

        let key = unique("tx");
        let outcome = pool
            .transaction()
            .multi(&[FixedCommand::new("SET", key.as_str(), "1")])
            .await
            .unwrap();
        assert!(matches!(outcome, TransactionOutcome::Committed(_)));
        pool.kv().del(&[key.as_str()]).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_s2s_exec_with_failed_command_commits() {
        init_tracing();
        let pool = Pool::connect(setup_s2s_config()).await.unwrap();
        let (key, list) = (unique("exec"), unique("list"));
        pool.list().rpush(&list, ["x"]).await.unwrap();

        let outcome = pool
            .transaction()
            .multi(&[
                FixedCommand::new("SET", key.as_str(), "1"),
                FixedCommand::new("INCRBY", list.as_str(), "1"),
            ])
            .await
            .unwrap();
        let replies = outcome.into_replies().unwrap();
        assert!(matches!(&replies[1], Reply::Error(msg) if msg.contains("WRONGTYPE")));
        assert_eq!(pool.kv().get_string(&key).await.unwrap(), Some("1".into()));

        pool.kv().del(&[key.as_str(), list.as_str()]).await.unwrap();
        pool.close();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_s2s_unreachable_server_is_dropped() {
        init_tracing();
        let mut config = setup_s2s_config();
        // Nothing listens on port 1
        config.servers.insert(0, ServerDescriptor::new("127.0.0.1", 1));

        let pool = Pool::connect(config).await.unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.execute(&kvguard::Command::new("PING")).await.is_ok());
    }
}
