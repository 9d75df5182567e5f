//! Session driver: a blocking tail read of the request stream, one
//! dispatch per message, replies appended in request order.

use anyhow::{anyhow, Result};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use shared::{MalleabilityAlgorithm, Response, REPLY_STREAM, REQUEST_STREAM};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Sentinel id for "only messages arriving after this point".
const STREAM_TAIL: &str = "$";

/// What the driver does after handling one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Emit the reply and keep reading.
    Reply(Response),
    /// Run the scheduling algorithm and emit its reply.
    Schedule {
        job_id: String,
        num_available_nodes: i64,
    },
    /// Emit the reply, then stop the session.
    ReplyAndStop(Response),
    /// Stop the session silently.
    Stop,
}

/// Map one inbound message to a driver action. Field presence and typing
/// are checked here so protocol errors never consume a telemetry call.
pub fn dispatch(message: &HashMap<String, String>) -> Outcome {
    let Some(command) = message.get("command") else {
        return Outcome::Reply(Response::error(
            r#""command" expected in message but is missing"#,
        ));
    };
    match command.as_str() {
        "invoke" => {
            let Some(job_id) = message.get("job_id") else {
                return Outcome::Reply(Response::error(
                    r#""job_id" expected in message but is missing"#,
                ));
            };
            let Some(raw_nodes) = message.get("num_available_nodes") else {
                return Outcome::Reply(Response::error(
                    r#""num_available_nodes" expected in message but is missing"#,
                ));
            };
            match raw_nodes.trim().parse() {
                Ok(num_available_nodes) => Outcome::Schedule {
                    job_id: job_id.clone(),
                    num_available_nodes,
                },
                Err(_) => Outcome::Reply(Response::error(format!(
                    r#""num_available_nodes" must be of type int but got "{raw_nodes}""#
                ))),
            }
        }
        "finalize" => Outcome::Stop,
        other => Outcome::ReplyAndStop(Response::error(format!("Unknown command {other}"))),
    }
}

/// One advisory session: owns the broker connection and the algorithm,
/// which in turn carries the frozen parameters and last computed figures.
pub struct Session<A> {
    redis: MultiplexedConnection,
    algorithm: A,
}

impl<A> Session<A>
where
    A: MalleabilityAlgorithm<Error = anyhow::Error>,
{
    pub fn new(redis: MultiplexedConnection, algorithm: A) -> Self {
        Self { redis, algorithm }
    }

    /// Consume the request stream until finalize, an unknown command, or a
    /// failed init. Unrecoverable broker and telemetry errors bubble up.
    pub async fn run(mut self) -> Result<()> {
        let (mut last_seen_id, message) = self.read_one(STREAM_TAIL).await?;
        if let Some(reply) = self.algorithm.initialize(&message) {
            warn!("session init rejected, terminating");
            self.emit(&reply).await?;
            return Ok(());
        }
        info!("session initialized, awaiting scheduling requests");

        loop {
            let (entry_id, message) = self.read_one(&last_seen_id).await?;
            last_seen_id = entry_id;

            match dispatch(&message) {
                Outcome::Reply(reply) => self.emit(&reply).await?,
                Outcome::Schedule {
                    job_id,
                    num_available_nodes,
                } => {
                    debug!(job = %job_id, free_nodes = num_available_nodes, "scheduling request");
                    let reply = self.algorithm.schedule(&job_id, num_available_nodes).await?;
                    self.emit(&reply).await?;
                }
                Outcome::ReplyAndStop(reply) => {
                    self.emit(&reply).await?;
                    return Ok(());
                }
                Outcome::Stop => {
                    info!("session finalized");
                    return Ok(());
                }
            }
        }
    }

    /// Blocking read of exactly one entry arriving after `after`.
    async fn read_one(&mut self, after: &str) -> Result<(String, HashMap<String, String>)> {
        let options = StreamReadOptions::default().count(1).block(0);
        let reply: StreamReadReply = self
            .redis
            .xread_options(&[REQUEST_STREAM], &[after], &options)
            .await?;
        let entry = reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .next()
            .ok_or_else(|| anyhow!("blocking stream read returned no entries"))?;

        let mut message = HashMap::with_capacity(entry.map.len());
        for (field, value) in entry.map {
            let value: String = redis::from_redis_value(&value)?;
            message.insert(field, value);
        }
        Ok((entry.id, message))
    }

    async fn emit(&mut self, reply: &Response) -> Result<()> {
        let fields = reply.fields();
        let _: String = self.redis.xadd(REPLY_STREAM, "*", fields.as_slice()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn missing_command_is_an_error_that_keeps_the_session() {
        let outcome = dispatch(&message(&[("job_id", "j1")]));
        match outcome {
            Outcome::Reply(Response::Error { message, .. }) => {
                assert!(message.contains(r#""command" expected"#));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn invoke_requires_job_id_and_node_budget() {
        let outcome = dispatch(&message(&[("command", "invoke")]));
        assert!(matches!(outcome, Outcome::Reply(Response::Error { .. })));

        let outcome = dispatch(&message(&[("command", "invoke"), ("job_id", "j1")]));
        match outcome {
            Outcome::Reply(Response::Error { message, .. }) => {
                assert!(message.contains("num_available_nodes"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn invoke_rejects_a_malformed_node_budget() {
        let outcome = dispatch(&message(&[
            ("command", "invoke"),
            ("job_id", "j1"),
            ("num_available_nodes", "lots"),
        ]));
        match outcome {
            Outcome::Reply(Response::Error { message, .. }) => {
                assert!(message.contains("must be of type int"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn invoke_parses_the_node_budget() {
        let outcome = dispatch(&message(&[
            ("command", "invoke"),
            ("job_id", "j1"),
            ("num_available_nodes", "8"),
        ]));
        assert_eq!(
            outcome,
            Outcome::Schedule {
                job_id: "j1".into(),
                num_available_nodes: 8,
            }
        );
    }

    #[test]
    fn finalize_stops_silently_and_unknown_commands_stop_loudly() {
        assert_eq!(dispatch(&message(&[("command", "finalize")])), Outcome::Stop);

        let outcome = dispatch(&message(&[("command", "reset")]));
        match outcome {
            Outcome::ReplyAndStop(Response::Error { message, .. }) => {
                assert_eq!(message, "Unknown command reset");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
