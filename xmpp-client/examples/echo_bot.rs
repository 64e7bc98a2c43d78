use futures::stream::StreamExt;
use std::env::args;
use std::process::exit;
use std::str::FromStr;
use xmpp_client::jid::{BareJid, Jid};
use xmpp_client::parsers::message::{Body, Message, MessageType};
use xmpp_client::parsers::presence::{Presence, Show as PresenceShow, Type as PresenceType};
use xmpp_client::{Client, ClientOptions, Event, ProxyType};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() != 3 {
        println!("Usage: {} <jid> <password>", args[0]);
        exit(1);
    }
    let jid = BareJid::from_str(&args[1]).expect(&format!("Invalid JID: {}", &args[1]));
    let password = &args[2];

    // Client instance
    let mut client = Client::new(jid, password.to_owned());
    let _availability = client.channel().on_available_changed(|available| {
        println!("Available: {}", available);
    });
    client.connect(ClientOptions {
        proxy_type: ProxyType::None,
        ..ClientOptions::default()
    });

    // Main loop, processes events
    while let Some(event) = client.next().await {
        println!("event: {:?}", event);
        match event {
            Event::Connected { bound_jid } => {
                println!("Online at {}", bound_jid);
                client.send_presence(make_presence()).unwrap();
            }
            Event::Disconnected(error) => {
                if let Some(error) = error {
                    println!("Disconnected: {}", error);
                }
                break;
            }
            Event::NeedCredentials => {
                println!("No password given");
                client.disconnect();
            }
            event => {
                let Some(message) = event
                    .into_stanza()
                    .and_then(|stanza| Message::try_from(stanza).ok())
                else {
                    continue;
                };
                match (message.from, message.bodies.get("")) {
                    (Some(ref from), Some(ref body)) if body.0 == "die" => {
                        println!("Secret die command triggered by {}", from);
                        client.disconnect();
                    }
                    (Some(ref from), Some(ref body)) => {
                        if message.type_ != MessageType::Error {
                            // This is a message we'll echo
                            let reply = make_reply(from.clone(), &body.0);
                            client.send_message(reply).unwrap();
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    client.shutdown();
}

// Construct a <presence/>
fn make_presence() -> Presence {
    let mut presence = Presence::new(PresenceType::None);
    presence.show = Some(PresenceShow::Chat);
    presence
        .statuses
        .insert(String::from("en"), String::from("Echoing messages."));
    presence
}

// Construct a chat <message/>
fn make_reply(to: Jid, body: &str) -> Message {
    let mut message = Message::new(Some(to));
    message.bodies.insert(String::new(), Body(body.to_owned()));
    message
}
