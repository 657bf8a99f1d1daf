use super::address::ServerAddress;
use super::description::ServerDescription;
use super::topology::TopologyDescription;

/// Capacity of the event channel; slow subscribers miss the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A change in the cluster's view of the deployment.
#[derive(Debug, Clone)]
pub enum SdamEvent {
    /// A server started being monitored.
    ServerOpening { address: ServerAddress },
    /// A server stopped being monitored.
    ServerClosed { address: ServerAddress },
    ServerDescriptionChanged {
        address: ServerAddress,
        previous: Box<ServerDescription>,
        new: Box<ServerDescription>,
    },
    TopologyDescriptionChanged {
        previous: Box<TopologyDescription>,
        new: Box<TopologyDescription>,
    },
}

/// The events describing the move from `previous` to `next`.
pub(crate) fn diff(previous: &TopologyDescription, next: &TopologyDescription) -> Vec<SdamEvent> {
    let mut events = Vec::new();
    for address in next.addresses().filter(|a| !previous.contains(a)) {
        events.push(SdamEvent::ServerOpening {
            address: address.clone(),
        });
    }
    for server in next.servers() {
        if let Some(old) = previous.server(&server.address) {
            if old != server {
                events.push(SdamEvent::ServerDescriptionChanged {
                    address: server.address.clone(),
                    previous: Box::new(old.clone()),
                    new: Box::new(server.clone()),
                });
            }
        }
    }
    for address in previous.addresses().filter(|a| !next.contains(a)) {
        events.push(SdamEvent::ServerClosed {
            address: address.clone(),
        });
    }
    if previous != next {
        events.push(SdamEvent::TopologyDescriptionChanged {
            previous: Box::new(previous.clone()),
            new: Box::new(next.clone()),
        });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::options::ClientOptions;

    #[test]
    fn test_diff() {
        let a = ServerAddress::new("a", 27017);
        let options = ClientOptions::builder().host(a.clone()).build();
        let topology = TopologyDescription::new(&options).unwrap();
        let next = topology.apply(ServerDescription::from_reply(
            a.clone(),
            doc! { "ok": 1, "secondary": true, "setName": "rs", "hosts": vec!["a:27017", "b:27017"], "maxWireVersion": 17 },
            None,
        ));

        let events = diff(&topology, &next);
        assert!(matches!(&events[0], SdamEvent::ServerOpening { address } if address.host() == "b"));
        assert!(events
            .iter()
            .any(|e| matches!(e, SdamEvent::ServerDescriptionChanged { address, .. } if *address == a)));
        assert!(matches!(events.last(), Some(SdamEvent::TopologyDescriptionChanged { .. })));
        assert!(diff(&next, &next).is_empty());
    }
}
