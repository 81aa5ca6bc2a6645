//! Tests for pool construction, failover and probing

mod common;

#[cfg(test)]
mod tests {
    use super::common::{memory_backends, setup_pool, setup_pool_with, single_attempt_policy};
    use kvguard::{Command, KvError, Pool, PoolConfig};

    #[tokio::test]
    async fn test_fresh_pool_is_healthy() {
        for n in 1..=4 {
            let pool = setup_pool(&memory_backends(n)).await;
            assert_eq!(pool.len(), n);
            assert_eq!(pool.active_index(), 0);
            assert!(!pool.all_down());
            for (i, status) in pool.status().iter().enumerate() {
                assert!(status.alive);
                assert_eq!(status.entropy, 0);
                assert_eq!(status.active, i == 0);
            }
        }
    }

    #[tokio::test]
    async fn test_connect_without_servers() {
        assert!(matches!(
            Pool::connect(PoolConfig::default()).await,
            Err(KvError::ServersEmpty)
        ));
    }

    #[tokio::test]
    async fn test_six_failures_switch_to_next_backend() {
        let backends = memory_backends(2);
        let pool = setup_pool_with(&backends, single_attempt_policy()).await;
        backends[0].set_reachable(false);

        for call in 1..=6 {
            let err = pool.execute(&Command::new("PING")).await.unwrap_err();
            assert!(err.is_connectivity(), "call {call}: {err}");
        }

        assert_eq!(pool.active_index(), 1);
        let status = pool.status();
        assert!(!status[0].alive);
        assert_eq!(status[0].entropy, 6);
        assert!(status[1].alive);
        assert_eq!(status[1].entropy, 0);

        // Traffic now lands on the second backend
        pool.execute(&Command::new("SET").arg("k").arg("v"))
            .await
            .unwrap();
        assert_eq!(
            pool.kv().get_string("k").await.unwrap(),
            Some("v".to_string())
        );
    }

    #[tokio::test]
    async fn test_single_backend_state_never_changes() {
        let backends = memory_backends(1);
        let pool = setup_pool_with(&backends, single_attempt_policy()).await;
        backends[0].set_reachable(false);

        for _ in 0..20 {
            assert!(pool.execute(&Command::new("PING")).await.is_err());
        }
        let status = pool.status();
        assert!(status[0].alive);
        assert_eq!(status[0].entropy, 0);
        assert!(!pool.all_down());
    }

    #[tokio::test]
    async fn test_concurrent_failures_switch_once() {
        let backends = memory_backends(3);
        let pool = setup_pool(&backends).await;
        backends[0].set_reachable(false);

        let calls: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.execute(&Command::new("PING")).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(pool.active_index(), 1);
        let status = pool.status();
        assert!(!status[0].alive);
        assert!(status[1].alive);
        assert!(status[2].alive);
        assert_eq!(status[2].entropy, 0);
    }

    #[tokio::test]
    async fn test_failover_revives_the_next_backend() {
        let backends = memory_backends(2);
        let pool = setup_pool_with(&backends, single_attempt_policy()).await;
        backends[0].set_reachable(false);
        backends[1].set_reachable(false);

        // Six failures on each backend move the pool around the ring; the
        // backend switched to is always revived, so the pool never goes dark
        for _ in 0..12 {
            assert!(pool.execute(&Command::new("PING")).await.is_err());
            assert!(!pool.all_down());
        }
        assert_eq!(pool.active_index(), 0);
        let status = pool.status();
        assert!(status[0].alive);
        assert!(!status[1].alive);

        backends[0].set_reachable(true);
        assert!(pool.execute(&Command::new("PING")).await.is_ok());
    }

    #[tokio::test]
    async fn test_no_reachable_backend_is_unavailable() {
        let backends = memory_backends(2);
        for backend in &backends {
            backend.set_reachable(false);
        }
        let pool = setup_pool(&backends).await;

        assert!(pool.is_empty());
        assert!(pool.all_down());
        assert!(matches!(
            pool.execute(&Command::new("PING")).await,
            Err(KvError::ServerUnavailable)
        ));
        assert!(matches!(
            pool.lock().lock("res", 1, 10).await,
            Err(KvError::ServerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_service() {
        let backends = memory_backends(2);
        let pool = setup_pool(&backends).await;
        let other_handle = pool.clone();

        pool.close();
        assert!(other_handle.is_closed());
        assert!(matches!(
            other_handle.kv().get("k").await,
            Err(KvError::Closed)
        ));
    }
}
