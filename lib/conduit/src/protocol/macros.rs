//! Declarative definition of message families. Each invocation produces the
//! record structs, their field codecs and descriptors, and a static entry
//! slice to hand to `Protocol::build`.

/// Defines one direction's family of message records.
///
/// ```ignore
/// message_records! {
///     pub family CLIENT_RECORDS {
///         "demo.client.Echo" record Echo {
///             text: String,
///         }
///         "demo.client.Ping" record Ping {}
///     }
/// }
/// ```
#[macro_export]
macro_rules! message_records {
    (
        $fvis:vis family $family:ident {
            $(
                $fq:literal record $name:ident {
                    $( $field:ident : $ftype:ty ),* $(,)?
                }
            )*
        }
    ) => {
        $(
            #[derive(Debug, Clone, PartialEq)]
            $fvis struct $name {
                $( pub $field : $ftype, )*
            }

            impl $crate::protocol::record::Codec for $name {
                fn descriptor() -> String {
                    format!("L{};", $fq)
                }

                fn encode<W: $crate::shared::SizedWrite>(
                    &self,
                    out: &mut W,
                ) -> $crate::shared::NetResult<()> {
                    let _ = &out;
                    $( $crate::protocol::record::Codec::encode(&self.$field, out)?; )*
                    Ok(())
                }

                fn decode<R: $crate::shared::SizedRead>(
                    stream: &mut R,
                ) -> $crate::shared::NetResult<Self> {
                    let _ = &stream;
                    Ok($name {
                        $( $field: <$ftype as $crate::protocol::record::Codec>::decode(stream)?, )*
                    })
                }
            }

            impl $crate::protocol::record::Record for $name {
                const FQ_NAME: &'static str = $fq;

                fn fields() -> Vec<(&'static str, String)> {
                    vec![
                        $(
                            (
                                stringify!($field),
                                <$ftype as $crate::protocol::record::Codec>::descriptor(),
                            ),
                        )*
                    ]
                }
            }

            impl $name {
                #[doc(hidden)]
                pub fn decode_erased(
                    payload: &[u8],
                ) -> $crate::shared::NetResult<Box<dyn std::any::Any>> {
                    let mut stream = std::io::Cursor::new(payload);
                    let record = <$name as $crate::protocol::record::Codec>::decode(&mut stream)?;

                    if $crate::shared::SizedRead::remaining_data(&stream) != 0 {
                        return Err($crate::shared::NetError::Serialization);
                    }

                    Ok(Box::new(record))
                }
            }
        )*

        $fvis static $family: &[$crate::protocol::registry::RecordEntry] = &[
            $(
                $crate::protocol::registry::RecordEntry {
                    fq_name: $fq,
                    fields: <$name as $crate::protocol::record::Record>::fields,
                    decode: $name::decode_erased,
                },
            )*
        ];
    };
}

/// Defines an enum field type carried as a 2-byte ordinal.
#[macro_export]
macro_rules! message_enum {
    (
        $fq:literal $evis:vis enum $name:ident { $( $variant:ident ),+ $(,)? }
    ) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        $evis enum $name {
            $( $variant, )+
        }

        impl $name {
            const VARIANTS: &'static [$name] = &[ $( $name::$variant, )+ ];
        }

        impl $crate::protocol::record::Codec for $name {
            fn descriptor() -> String {
                format!("L{};", $fq)
            }

            fn encode<W: $crate::shared::SizedWrite>(
                &self,
                out: &mut W,
            ) -> $crate::shared::NetResult<()> {
                std::io::Write::write_all(out, &(*self as u16).to_be_bytes())?;
                Ok(())
            }

            fn decode<R: $crate::shared::SizedRead>(
                stream: &mut R,
            ) -> $crate::shared::NetResult<Self> {
                let mut ordinal = [0u8; 2];
                std::io::Read::read_exact(stream, &mut ordinal)
                    .map_err(|_| $crate::shared::NetError::Serialization)?;

                Self::VARIANTS
                    .get(u16::from_be_bytes(ordinal) as usize)
                    .copied()
                    .ok_or($crate::shared::NetError::Serialization)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::protocol::record::{Bytes, Codec, Record};
    use crate::shared::{NetError, SizedRead};
    use std::io::Cursor;

    message_enum! {
        "test.Suit" enum Suit { Clubs, Diamonds, Hearts, Spades }
    }

    message_records! {
        family TEST_RECORDS {
            "test.Card" record Card {
                suit: Suit,
                rank: u8,
            }
            "test.Hand" record Hand {
                cards: Vec<Card>,
                wager: Option<i64>,
                note: String,
                blob: Bytes,
            }
            "test.Empty" record Empty {}
        }
    }

    #[test]
    fn test_enum_ordinal_roundtrip() {
        let mut buffer = Vec::new();
        Suit::Hearts.encode(&mut buffer).unwrap();

        assert_eq!(buffer, vec![0, 2]);

        let mut stream = Cursor::new(&buffer[..]);
        assert_eq!(Suit::decode(&mut stream).unwrap(), Suit::Hearts);
    }

    #[test]
    fn test_enum_rejects_unknown_ordinal() {
        let data = [0u8, 9];
        let mut stream = Cursor::new(&data[..]);

        assert_eq!(Suit::decode(&mut stream), Err(NetError::Serialization));
    }

    #[test]
    fn test_record_roundtrip() {
        let hand = Hand {
            cards: vec![
                Card {
                    suit: Suit::Spades,
                    rank: 1,
                },
                Card {
                    suit: Suit::Diamonds,
                    rank: 13,
                },
            ],
            wager: Some(500),
            note: "all in".to_string(),
            blob: Bytes(vec![0xde, 0xad]),
        };

        let mut buffer = Vec::new();
        hand.encode(&mut buffer).unwrap();

        let mut stream = Cursor::new(&buffer[..]);
        let decoded = Hand::decode(&mut stream).unwrap();

        assert_eq!(decoded, hand);
        assert_eq!(stream.remaining_data(), 0);
    }

    #[test]
    fn test_record_metadata() {
        assert_eq!(Card::FQ_NAME, "test.Card");
        assert_eq!(
            Card::fields(),
            vec![("suit", "Ltest.Suit;".to_string()), ("rank", "U".to_string())]
        );
        assert_eq!(Hand::fields()[0], ("cards", "List<Ltest.Card;>".to_string()));
        assert!(Empty::fields().is_empty());
    }

    #[test]
    fn test_family_entries() {
        assert_eq!(TEST_RECORDS.len(), 3);
        assert_eq!(TEST_RECORDS[0].fq_name, "test.Card");
        assert_eq!(TEST_RECORDS[2].fq_name, "test.Empty");
    }

    #[test]
    fn test_decode_erased_downcasts() {
        let mut buffer = Vec::new();
        Card {
            suit: Suit::Clubs,
            rank: 7,
        }
        .encode(&mut buffer)
        .unwrap();

        let erased = Card::decode_erased(&buffer).unwrap();
        let card = erased.downcast::<Card>().unwrap();

        assert_eq!(card.rank, 7);
    }

    #[test]
    fn test_decode_erased_rejects_trailing_bytes() {
        let mut buffer = Vec::new();
        Card {
            suit: Suit::Clubs,
            rank: 7,
        }
        .encode(&mut buffer)
        .unwrap();
        buffer.push(0xff);

        assert_eq!(Card::decode_erased(&buffer).unwrap_err(), NetError::Serialization);
    }
}
