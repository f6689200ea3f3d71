use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::CodecError;
use crate::record::Record;

/// Builds the request payload for one invoke batch.
pub trait RequestCodec<T>: Send + Sync {
    fn encode(&self, records: &[Record<T>]) -> Result<Vec<u8>, CodecError>;

    /// Bytes `record` adds to an encoded payload, used to cut batches by size.
    fn encoded_len(&self, record: &Record<T>) -> usize;
}

/// Turns a response payload back into records.
pub trait ResponseCodec<T>: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Vec<Record<T>>, CodecError>;
}

/// JSON request and response codec.
///
/// Requests are a JSON array of record data, wrapped as `{"<key_name>": [...]}`
/// when a key name is configured. Responses decode as:
/// - an array: one record per element
/// - an object holding an array under `key_name`: one record per element
/// - an empty object: no records
/// - any other object or scalar: a single record
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    key_name: Option<String>,
}

impl JsonCodec {
    pub fn new(key_name: Option<String>) -> Self {
        Self { key_name }
    }

    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    fn records_from<T: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<Record<T>>, CodecError> {
        values
            .into_iter()
            .map(|value| Ok(Record::new(serde_json::from_value(value)?)))
            .collect()
    }
}

impl<T> RequestCodec<T> for JsonCodec
where
    T: Serialize + Send + Sync,
{
    fn encode(&self, records: &[Record<T>]) -> Result<Vec<u8>, CodecError> {
        let data: Vec<&T> = records.iter().map(Record::data).collect();
        let payload = match &self.key_name {
            Some(key) => {
                let mut wrapper = serde_json::Map::new();
                wrapper.insert(key.clone(), serde_json::to_value(&data)?);
                serde_json::to_vec(&wrapper)?
            }
            None => serde_json::to_vec(&data)?,
        };
        Ok(payload)
    }

    fn encoded_len(&self, record: &Record<T>) -> usize {
        // element plus separator; an unserializable record fills a batch alone
        serde_json::to_vec(record.data())
            .map(|bytes| bytes.len() + 1)
            .unwrap_or(usize::MAX)
    }
}

impl<T> ResponseCodec<T> for JsonCodec
where
    T: DeserializeOwned + Send + Sync,
{
    fn decode(&self, payload: &[u8]) -> Result<Vec<Record<T>>, CodecError> {
        let value: Value = serde_json::from_slice(payload)?;
        match value {
            Value::Null => Err(CodecError::UnexpectedShape {
                reason: "response payload is null".to_string(),
            }),
            Value::Array(values) => Self::records_from(values),
            Value::Object(mut map) => {
                if let Some(key) = &self.key_name {
                    if matches!(map.get(key), Some(Value::Array(_))) {
                        if let Some(Value::Array(values)) = map.remove(key) {
                            return Self::records_from(values);
                        }
                    }
                }
                if map.is_empty() {
                    Ok(Vec::new())
                } else {
                    Self::records_from(vec![Value::Object(map)])
                }
            }
            scalar => Self::records_from(vec![scalar]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(codec: &JsonCodec, payload: &str) -> Result<Vec<Value>, CodecError> {
        ResponseCodec::<Value>::decode(codec, payload.as_bytes())
            .map(|records| records.into_iter().map(Record::into_data).collect())
    }

    #[test]
    fn test_encode_wraps_array_under_key_name() {
        let records = vec![Record::new(json!({"a": 1})), Record::new(json!({"a": 2}))];

        let wrapped = JsonCodec::new(Some("events".to_string()))
            .encode(&records)
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&wrapped).unwrap(),
            json!({"events": [{"a": 1}, {"a": 2}]})
        );

        let bare = JsonCodec::new(None).encode(&records).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&bare).unwrap(),
            json!([{"a": 1}, {"a": 2}])
        );
    }

    #[test]
    fn test_decode_shapes() {
        let codec = JsonCodec::new(Some("events".to_string()));

        assert_eq!(decode(&codec, r#"[{"x":1},{"x":2}]"#).unwrap().len(), 2);
        assert_eq!(
            decode(&codec, r#"{"events":[{"x":1}]}"#).unwrap(),
            vec![json!({"x": 1})]
        );
        assert!(decode(&codec, "{}").unwrap().is_empty());
        assert_eq!(
            decode(&codec, r#"{"status":"ok"}"#).unwrap(),
            vec![json!({"status": "ok"})]
        );
        assert_eq!(
            decode(&codec, r#"{"events":"none"}"#).unwrap(),
            vec![json!({"events": "none"})]
        );
        assert_eq!(decode(&codec, "\"done\"").unwrap(), vec![json!("done")]);
    }

    #[test]
    fn test_decode_rejects_null_and_garbage() {
        let codec = JsonCodec::default();
        assert!(matches!(
            decode(&codec, "null"),
            Err(CodecError::UnexpectedShape { .. })
        ));
        assert!(matches!(
            decode(&codec, "{not json"),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn test_decode_into_typed_records() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Enriched {
            id: u32,
        }

        let codec = JsonCodec::default();
        let records: Vec<Record<Enriched>> = codec.decode(br#"[{"id":3}]"#).unwrap();
        assert_eq!(records[0].data(), &Enriched { id: 3 });

        let err = ResponseCodec::<Enriched>::decode(&codec, br#"[{"id":"x"}]"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_unserializable_record_is_sized_to_fill_a_batch() {
        let codec = JsonCodec::new(None);
        let record = Record::new(std::collections::HashMap::from([((1, 2), 3)]));

        assert_eq!(RequestCodec::encoded_len(&codec, &record), usize::MAX);
        assert!(RequestCodec::encode(&codec, &[record]).is_err());
    }
}
