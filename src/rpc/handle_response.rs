use std::net::SocketAddr;

use tracing::debug;

use crate::common::{
    messages::{
        AnnounceResponseArguments, ErrorSpecific, GetValueResponseArguments, Message,
        MessageType, ResponseSpecific, ERROR_GENERIC,
    },
    unix_now, Node,
};

use super::{Rpc, RpcTickReport};

impl Rpc {
    /// Handle an inbound response or error: match it to an announce or iterative query,
    /// validate any returned value, and add the responder to the routing table.
    pub(super) fn handle_response(
        &mut self,
        from: SocketAddr,
        message: Message,
        report: &mut RpcTickReport,
    ) {
        let transaction_id = message.transaction_id;
        let author_id = message.get_author_id();
        let from_version = message.version;

        // KrpcSocket would not give us a response from the wrong address for the transaction_id
        if let Some(id) = author_id.filter(|id| *id != self.id) {
            let _ = self.routing_table.add(Node::responding(id, from));
        }

        if let Some(query) = self
            .announce_queries
            .values_mut()
            .find(|query| query.inflight(transaction_id))
        {
            match message.message_type {
                MessageType::Response(ResponseSpecific::Announce(AnnounceResponseArguments {
                    accepted: true,
                    ..
                })) => query.success(),
                MessageType::Response(ResponseSpecific::Announce(_)) => {
                    query.error(ErrorSpecific {
                        code: ERROR_GENERIC,
                        description: "Not accepted".to_string(),
                    })
                }
                MessageType::Error(error) => query.error(error),
                _ => {}
            };

            return;
        }

        let (query_id, query) = match self
            .iterative_queries
            .iter_mut()
            .find(|(_, query)| query.inflight(transaction_id))
        {
            Some((query_id, query)) => (*query_id, query),
            // A ping from maintenance, nothing more to do.
            None => return,
        };

        if let Some(nodes) = message.get_closer_nodes() {
            for node in nodes.iter().filter(|node| node.id != self.id) {
                let _ = self.routing_table.add(node.clone());
                query.add_candidate(node.clone());
            }
        }

        if let Some((responder_id, token)) = message.get_token() {
            query.add_responding_node(Node::new_with_token(responder_id, from, token.into()));
        } else if let Some(id) = author_id {
            query.add_responding_node(Node::responding(id, from));
        }

        match message.message_type {
            MessageType::Response(ResponseSpecific::GetValue(GetValueResponseArguments {
                responder_id,
                values,
                ..
            })) => {
                let now = unix_now();
                let user_type = query.user_type().map(String::from);

                for value in values {
                    if let Some(ref user_type) = user_type {
                        if value.user_type() != user_type {
                            debug!(
                                ?from,
                                ?responder_id,
                                utype = value.user_type(),
                                "Unrequested value type"
                            );
                            continue;
                        }
                    }

                    match value.validate(now) {
                        Ok(()) => {
                            if query.add_value(&value) {
                                debug!(target = ?query.target(), id = value.id(), ?from, "Query got value");
                                report.new_values.push((query_id, value));
                            }
                        }
                        Err(error) => {
                            debug!(
                                ?error,
                                ?from,
                                ?responder_id,
                                ?from_version,
                                "Invalid value"
                            );
                        }
                    }
                }
            }
            MessageType::Error(error) => {
                debug!(?error, ?from, ?from_version, "Query got error response");
            }
            _ => {}
        }
    }
}
