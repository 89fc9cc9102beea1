use super::*;
use crate::config::Settings;
use crate::transport::fake::FakeNetwork;
use crate::transport::Target;
use crossbeam::channel;

fn node() -> Arc<Node> {
    Node::with_dialer(
        Target::new("alpha"),
        &Settings::default(),
        Arc::new(FakeNetwork::new()),
    )
}

mod request {
    use super::*;

    #[test]
    fn defaults() {
        let request = Request::new("uptime");
        assert_eq!("uptime", request.command());
        assert!(request.stdin().is_empty());
        assert_eq!(None, request.deadline());
    }

    #[test]
    fn builder() {
        let request = Request::new("cat")
            .with_stdin("input")
            .with_deadline(Duration::from_secs(2));
        assert_eq!(b"input".as_slice(), request.stdin().as_ref());
        assert_eq!(Some(Duration::from_secs(2)), request.deadline());
    }

    #[test]
    fn reply_to_shares_stdin() {
        let original = Request::new("cat").with_stdin(vec![7; 4096]);
        let copy = original.reply_to(Discard);
        assert_eq!(original.command(), copy.command());
        assert_eq!(original.stdin().as_ptr(), copy.stdin().as_ptr());
    }

    #[test]
    fn respond_to_replaces_the_responder() {
        let (send, recv) = channel::unbounded::<Response>();
        let request = Request::new("true").respond_to(send);
        let (job, responder) = request.into_parts();
        assert_eq!("true", job.command);

        responder.deliver(Response::new(node(), 0, vec![], vec![]));
        assert_eq!(0, recv.try_recv().unwrap().exit_code());
    }

    #[test]
    fn delivery_to_a_closed_channel_is_ignored() {
        let (send, recv) = channel::unbounded::<Response>();
        drop(recv);
        Box::new(send).deliver(Response::new(node(), 0, vec![], vec![]));
    }

    #[test]
    fn debug_omits_the_payload() {
        let request = Request::new("cat").with_stdin("secret");
        let debug = format!("{request:?}");
        assert!(debug.contains("\"cat\""));
        assert!(!debug.contains("secret"));
    }
}

mod response {
    use super::*;

    #[test]
    fn accessors() {
        let node = node();
        let response = Response::new(node.clone(), 2, b"out".to_vec(), b"err".to_vec());
        assert!(Arc::ptr_eq(&node, response.node()));
        assert_eq!(2, response.exit_code());
        assert!(!response.success());
        assert!(!response.is_local_failure());
        assert_eq!(
            (b"out".to_vec(), b"err".to_vec()),
            response.into_output(),
        );
    }

    #[test]
    fn failure() {
        let response = Response::failure(node(), "no route to host");
        assert_eq!(LOCAL_FAILURE, response.exit_code());
        assert!(response.is_local_failure());
        assert!(response.stdout().is_empty());
        assert_eq!(b"no route to host\n", response.stderr());
    }

    #[test]
    fn debug_names_the_node() {
        let response = Response::new(node(), 0, b"hi\n".to_vec(), vec![]);
        let debug = format!("{response:?}");
        assert!(debug.contains("alpha:22"), "{debug}");
        assert!(debug.contains("hi\\n"), "{debug}");
    }
}
