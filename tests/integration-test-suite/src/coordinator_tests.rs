//! Coordinator pub/sub scenarios: registration, broadcast on change,
//! eviction on disconnect.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use wuild_coordinator::{CoordinatorClient, CoordinatorServer};
    use wuild_core::config::CoordinatorClientSettings;
    use wuild_core::{CoordinatorInfo, ToolServerInfo};

    fn settings(port: u16) -> CoordinatorClientSettings {
        CoordinatorClientSettings {
            hosts: vec!["127.0.0.1".to_string()],
            port,
            enabled: true,
            send_info_interval: Duration::from_millis(100),
        }
    }

    fn worker(name: &str, threads: u16) -> ToolServerInfo {
        ToolServerInfo {
            server_id: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 7767,
            tool_ids: vec!["gcc9".to_string()],
            total_threads: threads,
            ..ToolServerInfo::default()
        }
    }

    async fn wait_for_view(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<CoordinatorInfo>,
        predicate: impl Fn(&CoordinatorInfo) -> bool,
    ) -> CoordinatorInfo {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let view = rx.recv().await.expect("subscription alive");
                if predicate(&view) {
                    return view;
                }
            }
        })
        .await
        .expect("expected fleet view in time")
    }

    #[tokio::test]
    async fn servers_register_and_subscribers_see_them() {
        let coordinator = CoordinatorServer::start(0).await.unwrap();
        let port = coordinator.listen_port();

        // Two publishing tool servers.
        let publisher_a = CoordinatorClient::new(settings(port));
        publisher_a.set_tool_server_info(worker("server-a", 8));
        publisher_a.start();

        let publisher_b = CoordinatorClient::new(settings(port));
        publisher_b.set_tool_server_info(worker("server-b", 4));
        publisher_b.start();

        // One subscriber.
        let subscriber = CoordinatorClient::new(settings(port));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        subscriber.set_info_arrived_callback(Arc::new(move |view: &CoordinatorInfo| {
            let _ = tx.send(view.clone());
        }));
        subscriber.start();

        let view = wait_for_view(&mut rx, |v| v.tool_servers.len() == 2).await;
        let mut names: Vec<&str> = view.tool_servers.iter().map(|s| s.server_id.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["server-a", "server-b"]);
        assert_eq!(view.total_threads(), 12);

        subscriber.stop();
        publisher_a.stop();
        publisher_b.stop();
        coordinator.stop();
    }

    #[tokio::test]
    async fn updates_rebroadcast_and_identical_snapshots_do_not() {
        let coordinator = CoordinatorServer::start(0).await.unwrap();
        let port = coordinator.listen_port();

        let publisher = CoordinatorClient::new(settings(port));
        publisher.set_tool_server_info(worker("server-a", 8));
        publisher.start();

        let subscriber = CoordinatorClient::new(settings(port));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        subscriber.set_info_arrived_callback(Arc::new(move |view: &CoordinatorInfo| {
            let _ = tx.send(view.clone());
        }));
        subscriber.start();

        wait_for_view(&mut rx, |v| v.tool_servers.len() == 1).await;

        // Re-publishing identical info changes nothing downstream.
        publisher.set_tool_server_info(worker("server-a", 8));
        // A load change does.
        let mut busy = worker("server-a", 8);
        busy.running_tasks = 5;
        publisher.set_tool_server_info(busy);

        let view = wait_for_view(&mut rx, |v| {
            v.tool_servers.first().is_some_and(|s| s.running_tasks == 5)
        })
        .await;
        assert_eq!(view.tool_servers.len(), 1);

        subscriber.stop();
        publisher.stop();
        coordinator.stop();
    }

    #[tokio::test]
    async fn dead_servers_are_evicted_on_disconnect() {
        let coordinator = CoordinatorServer::start(0).await.unwrap();
        let port = coordinator.listen_port();

        let publisher_a = CoordinatorClient::new(settings(port));
        publisher_a.set_tool_server_info(worker("server-a", 8));
        publisher_a.start();

        let publisher_b = CoordinatorClient::new(settings(port));
        publisher_b.set_tool_server_info(worker("server-b", 4));
        publisher_b.start();

        let subscriber = CoordinatorClient::new(settings(port));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        subscriber.set_info_arrived_callback(Arc::new(move |view: &CoordinatorInfo| {
            let _ = tx.send(view.clone());
        }));
        subscriber.start();

        wait_for_view(&mut rx, |v| v.tool_servers.len() == 2).await;

        // Kill server A; its registry entry goes with the connection.
        publisher_a.stop();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if coordinator.fleet().len() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("eviction happens on handler destroy");
        assert_eq!(coordinator.fleet()[0].server_id, "server-b");

        // The loss travels with the next broadcast, triggered by B's
        // next real change.
        let mut busy = worker("server-b", 4);
        busy.running_tasks = 2;
        publisher_b.set_tool_server_info(busy);

        let view = wait_for_view(&mut rx, |v| v.tool_servers.len() == 1).await;
        assert_eq!(view.tool_servers[0].server_id, "server-b");

        subscriber.stop();
        publisher_b.stop();
        coordinator.stop();
    }
}
