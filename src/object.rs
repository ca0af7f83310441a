//! Record objects backed by the data API.

use serde_json::{Map, Value};

use crate::data_api::{DataApiClient, DataApiError};

/// A record of one data type: its id plus free-form attributes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataObject {
    id: String,
    data_type: String,
    attributes: Map<String, Value>,
}

impl DataObject {
    pub fn new(id: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data_type: data_type.into(),
            attributes: Map::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(key.into(), value)
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    pub fn clear(&mut self) {
        self.attributes.clear();
    }

    /// Deep-merges `record` into the attributes.
    ///
    /// Nested objects merge key by key; any other value replaces what was
    /// there. A non-object record is ignored, and an `id` in the record
    /// never overrides the object's own id.
    pub fn merge(&mut self, record: Value) {
        let Value::Object(record) = record else {
            return;
        };
        for (key, value) in record {
            if key == "id" {
                continue;
            }
            match self.attributes.get_mut(&key) {
                Some(existing) => merge_value(existing, value),
                None => {
                    self.attributes.insert(key, value);
                }
            }
        }
    }

    /// Attributes plus `id`, as sent to the data API.
    pub fn to_value(&self) -> Value {
        let mut record = self.attributes.clone();
        record.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(record)
    }
}

fn merge_value(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(target), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match target.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, incoming) => *target = incoming,
    }
}

/// A [`DataObject`] synchronized through a [`DataApiClient`].
#[derive(Clone, Debug)]
pub struct RemoteObject {
    object: DataObject,
    api: DataApiClient,
}

impl RemoteObject {
    pub fn new(api: DataApiClient, id: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            object: DataObject::new(id, data_type),
            api,
        }
    }

    pub fn object(&self) -> &DataObject {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut DataObject {
        &mut self.object
    }

    /// Fetches the record and merges it over local attributes.
    pub async fn get(&mut self) -> Result<&DataObject, DataApiError> {
        let record = self.fetch().await?;
        self.object.merge(record);
        Ok(&self.object)
    }

    /// Sends the local attributes to the data API.
    pub async fn update(&self) -> Result<&DataObject, DataApiError> {
        self.api
            .update(self.object.data_type(), self.object.id(), &self.object.to_value())
            .await?;
        Ok(&self.object)
    }

    /// Deletes the record. Local attributes are left untouched.
    pub async fn remove(&self) -> Result<Value, DataApiError> {
        self.api
            .delete(self.object.data_type(), self.object.id())
            .await
    }

    /// Replaces the local attributes with a fresh fetch.
    ///
    /// On failure the local attributes are kept.
    pub async fn reset(&mut self) -> Result<&DataObject, DataApiError> {
        let record = self.fetch().await?;
        self.object.clear();
        self.object.merge(record);
        Ok(&self.object)
    }

    async fn fetch(&self) -> Result<Value, DataApiError> {
        self.api.get(self.object.data_type(), self.object.id()).await
    }
}
