//! Event helpers (§4.7 supplemental): `Event::on` is a pipeline attachment
//! marking the first processor of the next pipeline as a listener;
//! `Event::send` is a processor-body shorthand for broadcasting one.

use crate::message::Message;
use crate::response::ResponseHandler;

use super::Attachment;

pub struct Event;

impl Event {
    /// Builds an attachment that registers `name` as a monitored event on
    /// whatever processor it's composed in front of.
    pub fn on(name: impl Into<String>) -> Attachment {
        let name = name.into();
        Attachment::new(move |processor| processor.monitor_event(name.clone()))
    }

    /// Broadcasts `name` to every processor subscribed to it (§4.3
    /// `send_event`).
    pub fn send(response: &ResponseHandler, name: impl Into<String>, payload: Message) {
        response.send_event(name, None, payload, true);
    }
}
