use super::*;
use crate::config::Settings;
use crate::error::Error;
use crate::request::LOCAL_FAILURE;
use crate::transport::fake::{FakeHost, FakeNetwork};
use crate::transport::Target;
use std::collections::HashMap;
use std::time::Duration;
use tracing_test::traced_test;

const HOSTS: [&str; 3] = ["alpha", "beta", "gamma"];

mod fixtures {
    use super::*;

    pub struct Fixture {
        pub network: FakeNetwork,
        pub list: NodeList,
    }

    impl Fixture {
        pub fn new() -> Self {
            let network = FakeNetwork::new();
            let list = HOSTS
                .iter()
                .map(|host| {
                    Node::with_dialer(
                        Target::new(*host),
                        &Settings::default(),
                        Arc::new(network.clone()),
                    )
                })
                .collect();
            Fixture { network, list }
        }

        pub fn connected() -> Self {
            let fixture = Self::new();
            fixture.list.connect().unwrap();
            fixture
        }

        pub fn host(&self, name: &str) -> Arc<FakeHost> {
            self.network.host(name)
        }
    }

    /// Collects a round's responses by host name, checking that no host answers twice.
    pub fn by_host(responses: Responses) -> HashMap<String, Response> {
        let mut by_host = HashMap::new();
        for response in responses {
            let host = response.node().target().host.clone();
            assert!(
                by_host.insert(host.clone(), response).is_none(),
                "{host} answered twice",
            );
        }
        by_host
    }

    /// Passes the response along after recording which round it belongs to.
    pub struct Tagged {
        pub tag: usize,
        pub log: Arc<Mutex<Vec<(String, usize)>>>,
        pub inner: Responder,
    }

    impl Respond for Tagged {
        fn deliver(self: Box<Self>, response: Response) {
            let host = response.node().target().host.clone();
            self.log.lock().unwrap().push((host, self.tag));
            Box::new(self.inner).deliver(response);
        }
    }
}
use fixtures::*;

mod selection {
    use super::*;

    #[test]
    fn take_shares_nodes() {
        let fixture = Fixture::new();
        let first = fixture.list.take(2);
        assert_eq!(2, first.len());
        assert!(Arc::ptr_eq(&fixture.list.nodes[0], &first.nodes[0]));
        assert!(Arc::ptr_eq(&fixture.list.nodes[1], &first.nodes[1]));
    }

    #[test]
    fn take_past_the_end() {
        let fixture = Fixture::new();
        assert_eq!(3, fixture.list.take(10).len());
        assert!(fixture.list.take(0).is_empty());
    }

    #[test]
    fn skip_shares_nodes() {
        let fixture = Fixture::new();
        let rest = fixture.list.skip(1);
        assert_eq!(2, rest.len());
        assert!(Arc::ptr_eq(&fixture.list.nodes[1], &rest.nodes[0]));
        assert!(fixture.list.skip(3).is_empty());
        assert!(fixture.list.skip(4).is_empty());
    }

    #[test]
    fn filter_keeps_order() {
        let fixture = Fixture::new();
        let picked = fixture.list.filter(|node| node.target().host != "beta");
        let hosts: Vec<&str> = picked.iter().map(|node| node.target().host.as_str()).collect();
        assert_eq!(vec!["alpha", "gamma"], hosts);
    }

    #[test]
    fn selection_has_no_network_effect() {
        let fixture = Fixture::new();
        fixture.list.take(1).skip(0).filter(|_| true);
        for host in HOSTS {
            assert!(fixture.host(host).dials().is_empty());
        }
    }

    #[test]
    fn debug_lists_targets() {
        let fixture = Fixture::new();
        assert_eq!(
            r#"["alpha:22", "beta:22", "gamma:22"]"#,
            format!("{:?}", fixture.list),
        );
    }
}

mod connect {
    use super::*;

    #[test]
    fn connects_every_node() {
        let fixture = Fixture::connected();
        assert!(fixture.list.iter().all(|node| node.is_listening()));
    }

    #[test]
    fn stops_at_the_first_failure() {
        let fixture = Fixture::new();
        fixture.host("beta").set_unreachable(true);

        let error = fixture.list.connect().unwrap_err();
        assert!(matches!(error, Error::Connection { .. }));
        assert!(fixture.list.nodes[0].is_listening());
        assert!(!fixture.list.nodes[1].is_listening());
        assert!(!fixture.list.nodes[2].is_listening());
        assert!(fixture.host("gamma").dials().is_empty());
    }
}

mod close {
    use super::*;

    #[test]
    fn closes_every_node() {
        let fixture = Fixture::connected();
        fixture.list.close().unwrap();
        for host in HOSTS {
            assert_eq!(1, fixture.host(host).closes());
        }
    }

    #[test]
    fn stops_at_the_first_failure() {
        let fixture = Fixture::new();
        fixture.list.nodes[0].connect().unwrap();
        fixture.list.nodes[2].connect().unwrap();

        let error = fixture.list.close().unwrap_err();
        assert!(matches!(error, Error::NotListening { .. }));
        assert!(!fixture.list.nodes[0].is_listening());
        assert!(fixture.list.nodes[2].is_listening());
    }
}

mod each {
    use super::*;

    #[test]
    fn one_response_per_node() {
        let fixture = Fixture::connected();
        let responses = by_host(fixture.list.run("echo hello"));
        assert_eq!(3, responses.len());
        for host in HOSTS {
            let response = &responses[host];
            assert_eq!(0, response.exit_code());
            assert_eq!(b"hello\n", response.stdout());
        }
    }

    #[test]
    fn empty_list_ends_at_once() {
        let list = NodeList::default();
        assert_eq!(0, list.run("echo hello").count());
    }

    #[test]
    fn calls_build_in_order() {
        let fixture = Fixture::connected();
        let mut seen = vec![];
        let responses = fixture.list.each(|node, responder| {
            seen.push(node.target().host.clone());
            node.execute(Request::new("exit 0").respond_to(responder))
        });
        assert_eq!(3, responses.count());
        assert_eq!(HOSTS.to_vec(), seen);
    }

    #[test]
    fn per_node_commands() {
        let fixture = Fixture::connected();
        let responses = by_host(fixture.list.each(|node, responder| {
            let command = format!("echo I am {}", node.target().host);
            node.execute(Request::new(command).respond_to(responder))
        }));
        assert_eq!(b"I am beta\n", responses["beta"].stdout());
    }

    #[test]
    fn unconnected_node_is_a_failure_response() {
        let fixture = Fixture::new();
        fixture.list.nodes[0].connect().unwrap();
        fixture.list.nodes[2].connect().unwrap();

        let responses = by_host(fixture.list.run("echo hello"));
        assert_eq!(3, responses.len());
        assert_eq!(0, responses["alpha"].exit_code());
        assert_eq!(0, responses["gamma"].exit_code());

        let beta = &responses["beta"];
        assert_eq!(LOCAL_FAILURE, beta.exit_code());
        let stderr = String::from_utf8_lossy(beta.stderr());
        assert!(stderr.contains("failed to dispatch"), "{stderr}");
        assert!(stderr.contains("beta:22 is not connected"), "{stderr}");
    }

    #[test]
    #[traced_test]
    fn dispatch_failures_are_logged() {
        let fixture = Fixture::new();
        assert_eq!(3, fixture.list.run("echo hello").count());
        assert!(logs_contain("failed to dispatch a request"));
    }

    #[test]
    fn build_errors_are_failure_responses() {
        let fixture = Fixture::connected();
        let responses = by_host(fixture.list.each(|node, responder| {
            if node.target().host == "alpha" {
                return Err(Error::InvalidDestination("nowhere".to_string()));
            }
            node.execute(Request::new("echo ok").respond_to(responder))
        }));
        assert_eq!(3, responses.len());
        assert!(responses["alpha"].is_local_failure());
        assert!(responses["beta"].success());
    }

    #[test]
    fn unused_responders_are_failure_responses() {
        let fixture = Fixture::connected();
        let responses = by_host(fixture.list.each(|_, responder| {
            drop(responder);
            Ok(())
        }));
        assert_eq!(3, responses.len());
        for response in responses.values() {
            assert!(response.is_local_failure());
            assert_eq!(format!("{DROPPED}\n").as_bytes(), response.stderr());
        }
    }

    #[test]
    fn immediate_delivery_counts_once() {
        let fixture = Fixture::connected();
        let responses = by_host(fixture.list.each(|node, responder| {
            let response = Response::new(node.clone(), 0, b"local\n".to_vec(), vec![]);
            Box::new(responder).deliver(response);
            Ok(())
        }));
        assert_eq!(3, responses.len());
        assert!(responses.values().all(|response| response.stdout() == b"local\n"));
    }

    #[test]
    fn late_delivery_is_discarded() {
        let fixture = Fixture::connected();
        let mut stashed = vec![];
        let responses: Vec<Response> = fixture
            .list
            .each(|node, responder| {
                stashed.push((node.clone(), responder));
                Err(Error::NotConnected {
                    target: node.target().to_string(),
                })
            })
            .collect();
        assert_eq!(3, responses.len());

        // The round is over; these go nowhere.
        for (node, responder) in stashed {
            Box::new(responder).deliver(Response::new(node, 0, vec![], vec![]));
        }
    }

    #[test]
    fn dead_worker_is_a_failure_response() {
        let fixture = Fixture::connected();
        let responses = by_host(fixture.list.each(|node, responder| {
            let command = match node.target().host.as_str() {
                "beta" => "panic",
                _ => "echo fine",
            };
            node.execute(Request::new(command).respond_to(responder))
        }));
        assert_eq!(3, responses.len());
        assert!(responses["alpha"].success());
        assert!(responses["gamma"].success());
        assert!(responses["beta"].is_local_failure());
        assert_eq!(format!("{DROPPED}\n").as_bytes(), responses["beta"].stderr());
    }

    #[test]
    fn timeouts_do_not_stall_the_round() {
        let fixture = Fixture::connected();
        let responses = by_host(fixture.list.each(|node, responder| {
            let command = match node.target().host.as_str() {
                "gamma" => "hang",
                _ => "echo fine",
            };
            let request = Request::new(command)
                .with_deadline(Duration::from_millis(100))
                .respond_to(responder);
            node.execute(request)
        }));
        assert!(responses["alpha"].success());
        assert!(responses["gamma"].is_local_failure());
    }

    #[test]
    fn dropping_the_stream_early_is_harmless() {
        let fixture = Fixture::connected();
        drop(fixture.list.run("echo ignored"));

        // The nodes carry on with the next round.
        assert_eq!(3, fixture.list.run("echo hello").count());
    }

    #[test]
    fn same_node_responses_keep_their_order() {
        let fixture = Fixture::connected();
        fixture.host("alpha").set_latency(Duration::from_millis(20));
        let log = Arc::new(Mutex::new(vec![]));

        let rounds: Vec<Responses> = (0..3)
            .map(|tag| {
                fixture.list.each(|node, responder| {
                    let tagged = Tagged {
                        tag,
                        log: log.clone(),
                        inner: responder,
                    };
                    node.execute(Request::new(format!("echo {tag}")).respond_to(tagged))
                })
            })
            .collect();
        for round in rounds {
            assert_eq!(3, round.count());
        }

        let log = log.lock().unwrap();
        for host in HOSTS {
            let tags: Vec<usize> = log
                .iter()
                .filter(|(name, _)| name == host)
                .map(|(_, tag)| *tag)
                .collect();
            assert_eq!(vec![0, 1, 2], tags, "{host}");
        }
    }
}

mod copy {
    use super::*;
    use std::io::Write;

    #[test]
    fn copies_to_every_node() -> anyhow::Result<()> {
        let fixture = Fixture::connected();
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"hello world")?;

        let responses = by_host(fixture.list.copy(file.path(), "hello.txt")?);
        assert_eq!(3, responses.len());
        assert!(responses.values().all(Response::success));

        for response in fixture.list.run("cat hello.txt") {
            assert_eq!(b"hello world", response.stdout());
        }
        Ok(())
    }

    #[test]
    fn missing_source_sends_nothing() {
        let fixture = Fixture::connected();
        let error = fixture
            .list
            .copy("/nonexistent/hello.txt", "hello.txt")
            .unwrap_err();
        assert!(matches!(error, Error::Io { .. }));
        for host in HOSTS {
            assert!(fixture.host(host).commands().is_empty());
        }
    }

    #[test]
    fn pipe_round_trip() -> anyhow::Result<()> {
        let fixture = Fixture::connected();
        let content = b"first line\nsecond line\n";
        let responses = fixture
            .list
            .write_with("notes/today.txt", content, Encoding::Pipe)?;
        assert_eq!(3, responses.filter(Response::success).count());

        for response in fixture.list.run("cat notes/today.txt") {
            assert_eq!(content, response.stdout());
        }
        Ok(())
    }

    #[test]
    fn write_sets_the_default_mode() -> anyhow::Result<()> {
        let fixture = Fixture::connected();
        let responses = fixture.list.take(1).write("/srv/motd", b"welcome\n")?;
        assert_eq!(1, responses.count());
        assert_eq!(Some(0o644), fixture.host("alpha").mode("/srv/motd"));
        assert_eq!(Some(b"welcome\n".to_vec()), fixture.host("alpha").file("/srv/motd"));
        assert_eq!(None, fixture.host("beta").file("/srv/motd"));
        Ok(())
    }
}
