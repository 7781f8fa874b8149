/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use core::fmt;

use bytes::Bytes;

use crate::{message::CodedMessage, Error};

/// A Codec is responsible for the byte representation of messages as
/// they go over a [`crate::Transport`].
///
/// So you can paint your bike shed however you like: wrap one codec in
/// another for compression, pin a wire version, swap serialization
/// formats per deployment.
pub trait Codec: Send + Sync {
    /// Encodes `coded.message` into `coded.bytes`, recording the
    /// resulting size in `coded.size`.
    ///
    /// Implementations that cannot know their output size should
    /// leave `coded.size` at zero; the broker then stops limiting
    /// piggybacked broadcasts.
    fn encode(&self, coded: &mut CodedMessage) -> Result<(), Error>;

    /// Decodes `coded.bytes` into `coded.message`.
    ///
    /// The bytes are guaranteed not to change between calls with the
    /// same [`CodedMessage`] instance.
    fn decode(&self, coded: &mut CodedMessage) -> Result<(), Error>;
}

#[derive(Debug)]
struct MissingPayload;

impl fmt::Display for MissingPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("coded message carries no decoded payload")
    }
}

impl std::error::Error for MissingPayload {}

/// `BincodeCodec` encodes/decodes messages using [`bincode`].
///
/// This struct simply wraps a [`bincode::config::Config`] type:
///
/// ~~~rust
/// let codec = cardume::BincodeCodec(bincode::config::standard());
/// ~~~
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec<O: bincode::config::Config>(pub O);

impl BincodeCodec<bincode::config::Configuration> {
    /// A codec over bincode's standard configuration.
    pub fn standard() -> Self {
        Self(bincode::config::standard())
    }
}

impl<O> Codec for BincodeCodec<O>
where
    O: bincode::config::Config + Copy + Send + Sync,
{
    fn encode(&self, coded: &mut CodedMessage) -> Result<(), Error> {
        let message = coded.message.as_ref().ok_or(Error::Encode(Box::new(MissingPayload)))?;

        let bytes = bincode::serde::encode_to_vec(message, self.0).map_err(Error::encode)?;
        coded.size = bytes.len();
        coded.bytes = Bytes::from(bytes);
        Ok(())
    }

    fn decode(&self, coded: &mut CodedMessage) -> Result<(), Error> {
        let (message, _) =
            bincode::serde::decode_from_slice(&coded.bytes, self.0).map_err(Error::decode)?;
        coded.message = Some(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::Event, message::Message, seq::Seq, Node};

    #[test]
    fn bincode_roundtrip() {
        let codec = BincodeCodec::standard();

        let mut msg = Message::new(1, 2, Seq::new(3));
        msg.add_event(Event::Ping { from: 1, time: 42 });
        msg.add_event(Event::Alive {
            from: 1,
            node: Node::with_addr(4, "n4"),
        });

        let mut coded = CodedMessage::from_message(msg.clone());
        codec.encode(&mut coded).expect("encode");
        assert_eq!(coded.size, coded.bytes.len());
        assert!(coded.size > 0);

        let mut inbound = CodedMessage::from_bytes(coded.bytes.clone());
        codec.decode(&mut inbound).expect("decode");
        assert_eq!(Some(msg), inbound.message);
    }

    #[test]
    fn junk_does_not_decode() {
        let codec = BincodeCodec::standard();
        let mut coded = CodedMessage::from_bytes(Bytes::from_static(&[0xff; 3]));

        assert!(matches!(codec.decode(&mut coded), Err(Error::Decode(_))));
    }

    #[test]
    fn encoding_nothing_is_an_error() {
        let codec = BincodeCodec::standard();
        let mut coded = CodedMessage::default();

        assert!(matches!(codec.encode(&mut coded), Err(Error::Encode(_))));
    }
}
