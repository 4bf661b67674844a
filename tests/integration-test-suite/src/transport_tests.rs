//! Transport-level scenarios over loopback TCP.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    use wuild_core::protocol::tool::{ToolRequest, ToolResponse};
    use wuild_core::CompressionInfo;
    use wuild_transport::{
        typed_reader, FrameHandler, FrameHandlerSettings, FrameService, ReplyOutcome,
        SegmentAssembler, SegmentEvent, ServiceHooks,
    };

    fn quiet_settings() -> FrameHandlerSettings {
        FrameHandlerSettings {
            protocol_version: 7,
            after_disconnect_wait: Duration::from_millis(100),
            ..FrameHandlerSettings::default()
        }
    }

    fn sample_request(payload_len: usize) -> ToolRequest {
        ToolRequest {
            client_id: "it-client".into(),
            session_id: 42,
            file_data: Bytes::from(vec![0xA5; payload_len]),
            args: vec!["-c".into(), "pp_a.cpp".into(), "-o".into(), "a.o".into()],
            tool_id: "gcc9".into(),
            compression: CompressionInfo::default(),
        }
    }

    async fn echo_service(settings: FrameHandlerSettings) -> FrameService {
        let hooks = ServiceHooks::new(
            |_owner, handler| {
                handler
                    .register_reader(typed_reader(move |request: ToolRequest, output| {
                        output.send(&ToolResponse {
                            result: true,
                            file_data: request.file_data.clone(),
                            std_out: format!("echo {}", request.tool_id),
                            execution_time: Duration::from_millis(1),
                            compression: request.compression,
                        });
                    }))
                    .unwrap();
            },
            |_owner| {},
        );
        FrameService::bind("127.0.0.1", 0, settings, hooks)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn request_reply_round_trip_across_segmentation() {
        // Tiny segments force every frame to span many segments.
        let mut settings = quiet_settings();
        settings.segment_size = 48;
        let service = echo_service(settings.clone()).await;

        let handler = FrameHandler::connect("127.0.0.1", service.local_addr().port(), settings);
        handler.start();

        let request = sample_request(4096);
        let response: ToolResponse = handler
            .request(&request, Some(Duration::from_secs(5)))
            .await
            .expect("echo reply");
        assert!(response.result);
        assert_eq!(response.file_data, request.file_data);
        assert_eq!(response.std_out, "echo gcc9");

        handler.stop();
        service.stop();
    }

    #[tokio::test]
    async fn reply_times_out_when_the_peer_stays_silent() {
        // Service with no reader for ToolRequest: it will never answer.
        let settings = quiet_settings();
        let hooks = ServiceHooks::new(|_owner, _handler| {}, |_owner| {});
        let service = FrameService::bind("127.0.0.1", 0, settings.clone(), hooks)
            .await
            .unwrap();

        let handler = FrameHandler::connect("127.0.0.1", service.local_addr().port(), settings);
        handler.start();

        let outcomes = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let outcomes = outcomes.clone();
            let timeouts = timeouts.clone();
            handler.queue_frame_with_reply(
                &sample_request(16),
                Box::new(move |outcome| {
                    outcomes.fetch_add(1, Ordering::SeqCst);
                    if matches!(outcome, ReplyOutcome::Timeout) {
                        timeouts.fetch_add(1, Ordering::SeqCst);
                    }
                    let _ = tx.send(());
                }),
                Some(Duration::from_millis(200)),
            );
        }

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("notifier fires")
            .unwrap();
        assert_eq!(outcomes.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);

        handler.stop();
        service.stop();
    }

    #[tokio::test]
    async fn pending_reply_fails_exactly_once_on_disconnect() {
        let settings = quiet_settings();
        let hooks = ServiceHooks::new(|_owner, _handler| {}, |_owner| {});
        let service = FrameService::bind("127.0.0.1", 0, settings.clone(), hooks)
            .await
            .unwrap();

        let handler = FrameHandler::connect("127.0.0.1", service.local_addr().port(), settings);

        // Wait for the connection before queueing, then kill the server.
        let (connected_tx, connected_rx) = tokio::sync::oneshot::channel();
        let connected_tx = std::sync::Mutex::new(Some(connected_tx));
        handler.set_channel_notifier(Arc::new(move |state| {
            if state {
                if let Some(tx) = connected_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        }));
        handler.start();
        tokio::time::timeout(Duration::from_secs(5), connected_rx)
            .await
            .expect("client connects")
            .unwrap();

        let outcomes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let outcomes = outcomes.clone();
            let errors = errors.clone();
            handler.queue_frame_with_reply(
                &sample_request(16),
                Box::new(move |outcome| {
                    outcomes.fetch_add(1, Ordering::SeqCst);
                    if matches!(outcome, ReplyOutcome::Error) {
                        errors.fetch_add(1, Ordering::SeqCst);
                    }
                    let _ = tx.send(());
                }),
                Some(Duration::from_secs(30)),
            );
        }
        // Let the frame leave the queue, then drop every connection.
        tokio::time::sleep(Duration::from_millis(100)).await;
        service.stop();

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("notifier fires")
            .unwrap();
        // Exactly once, with Error; reconnect attempts must not re-fire.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(outcomes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        handler.stop();
    }

    #[tokio::test]
    async fn protocol_version_mismatch_is_fatal() {
        let mut server_settings = quiet_settings();
        server_settings.protocol_version = 1;
        let hooks = ServiceHooks::new(|_owner, _handler| {}, |_owner| {});
        let service = FrameService::bind("127.0.0.1", 0, server_settings, hooks)
            .await
            .unwrap();

        let mut client_settings = quiet_settings();
        client_settings.protocol_version = 2;
        let handler = FrameHandler::connect(
            "127.0.0.1",
            service.local_addr().port(),
            client_settings,
        );
        handler.start();

        // Fatal: the handler terminates instead of redialing.
        tokio::time::timeout(Duration::from_secs(5), handler.wait_closed())
            .await
            .expect("handler gives up");
        assert!(!handler.is_active());
        service.stop();
    }

    #[tokio::test]
    async fn acknowledge_window_throttles_the_sender() {
        // Window after handshake: min(1280, 1280) * 8/10 = 1024 bytes.
        let mut settings = quiet_settings();
        settings.segment_size = 128;
        settings.recommended_send_buffer_size = 1280;
        settings.recommended_receive_buffer_size = 1280;
        settings.has_line_test = false;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handler = FrameHandler::connect("127.0.0.1", port, settings.clone());
        handler.start();
        handler.queue_frame(&sample_request(10 * 1024));

        let (mut socket, _) = listener.accept().await.unwrap();

        // Hand-rolled peer: parses segments but withholds acknowledges.
        let mut assembler = SegmentAssembler::new(settings.segment_size);
        let mut received_total = 0usize;

        // Announce our small receive buffer; send no acks yet.
        let hello = wuild_transport_conn_options(1280, settings.protocol_version);
        socket.write_all(&hello).await.unwrap();

        let mut frames = Vec::new();
        let mut stalled_at = None;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            let read = tokio::time::timeout(
                Duration::from_millis(300),
                socket.readable(),
            )
            .await;
            if read.is_err() {
                // No bytes for 300 ms: the sender is suspended.
                stalled_at = Some(received_total);
                break;
            }
            read.unwrap().unwrap();
            match socket.try_read_buf(assembler.read_buffer()) {
                Ok(0) => break,
                Ok(n) => {
                    received_total += n;
                    for event in assembler.drain_events().unwrap() {
                        if let SegmentEvent::Frame(frame) = event {
                            frames.push(frame);
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read error: {e}"),
            }
        }

        let stalled_at = stalled_at.expect("sender must stall without acks");
        // The sender may spend its pre-handshake window (3276 bytes) but
        // never the whole 10 KiB frame.
        assert!(
            stalled_at <= 3276 + 256,
            "sender wrote {stalled_at} bytes without any acknowledge"
        );
        assert!(frames.is_empty(), "frame cannot complete before acks flow");

        // Acknowledge everything so far: the remainder must now arrive.
        loop {
            let ack = wuild_transport_ack(received_total as u32);
            socket.write_all(&ack).await.unwrap();
            let read = tokio::time::timeout(Duration::from_secs(2), socket.readable()).await;
            if read.is_err() {
                break;
            }
            read.unwrap().unwrap();
            match socket.try_read_buf(assembler.read_buffer()) {
                Ok(0) => break,
                Ok(_) => {
                    for event in assembler.drain_events().unwrap() {
                        if let SegmentEvent::Frame(frame) = event {
                            frames.push(frame);
                        }
                    }
                    if !frames.is_empty() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read error: {e}"),
            }
        }

        assert_eq!(frames.len(), 1, "the full frame decodes after acks");
        let decoded = frames[0].to_body::<ToolRequest>().unwrap();
        assert_eq!(decoded.file_data.len(), 10 * 1024);

        handler.stop();
    }

    // Minimal service-segment encoders for the hand-rolled peer.
    fn wuild_transport_conn_options(receive_buffer: u32, version: u32) -> Vec<u8> {
        let mut out = vec![0x03];
        out.extend_from_slice(&receive_buffer.to_be_bytes());
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&0i64.to_be_bytes());
        out
    }

    fn wuild_transport_ack(bytes: u32) -> Vec<u8> {
        let mut out = vec![0x01];
        out.extend_from_slice(&bytes.to_be_bytes());
        out
    }
}
