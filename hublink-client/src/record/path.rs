//! Dotted-path access into record data.
//!
//! Paths address object members with dots and array elements with
//! brackets: `pets[0].age`. Writes create intermediate objects and grow
//! arrays as needed; reads return `None` for anything not present.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Key(String),
    Index(usize),
}

fn tokenize(path: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for segment in path.split('.') {
        let mut rest = segment;
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                tokens.push(Token::Key(rest[..bracket].to_string()));
            }
            rest = &rest[bracket..];
            while let Some(end) = rest.find(']') {
                if let Ok(index) = rest[1..end].parse::<usize>() {
                    tokens.push(Token::Index(index));
                }
                rest = &rest[end + 1..];
                if !rest.starts_with('[') {
                    break;
                }
            }
        } else if !segment.is_empty() {
            tokens.push(Token::Key(segment.to_string()));
        }
    }
    tokens
}

/// The value at `path`, if present.
pub(crate) fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for token in tokenize(path) {
        current = match token {
            Token::Key(key) => current.as_object()?.get(&key)?,
            Token::Index(index) => current.as_array()?.get(index)?,
        };
    }
    Some(current)
}

/// Set `path` to `value`, materialising missing containers on the way.
pub(crate) fn set(root: &mut Value, path: &str, value: Value) {
    let tokens = tokenize(path);
    if tokens.is_empty() {
        *root = value;
        return;
    }

    let mut current = root;
    for (position, token) in tokens.iter().enumerate() {
        let last = position == tokens.len() - 1;
        match token {
            Token::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                let object = current.as_object_mut().unwrap();
                if last {
                    object.insert(key.clone(), value);
                    return;
                }
                current = object.entry(key.clone()).or_insert(Value::Null);
            }
            Token::Index(index) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let array = current.as_array_mut().unwrap();
                while array.len() <= *index {
                    array.push(Value::Null);
                }
                if last {
                    array[*index] = value;
                    return;
                }
                current = &mut array[*index];
            }
        }
    }
}

/// Remove the value at `path`. Object members are dropped, array
/// elements spliced out. Missing paths are left alone.
pub(crate) fn delete(root: &mut Value, path: &str) {
    let tokens = tokenize(path);
    let Some((last, parents)) = tokens.split_last() else {
        return;
    };

    let mut current = root;
    for token in parents {
        let next = match token {
            Token::Key(key) => current.as_object_mut().and_then(|o| o.get_mut(key)),
            Token::Index(index) => current.as_array_mut().and_then(|a| a.get_mut(*index)),
        };
        match next {
            Some(next) => current = next,
            None => return,
        }
    }

    match last {
        Token::Key(key) => {
            if let Some(object) = current.as_object_mut() {
                object.remove(key);
            }
        }
        Token::Index(index) => {
            if let Some(array) = current.as_array_mut() {
                if *index < array.len() {
                    array.remove(*index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "name": "Yasser",
            "pets": [ { "type": "Dog", "name": "Whiskey", "age": 3 } ]
        })
    }

    #[test]
    fn test_get_member() {
        assert_eq!(get(&sample(), "name"), Some(&json!("Yasser")));
    }

    #[test]
    fn test_get_array_element() {
        let data = sample();
        assert_eq!(
            get(&data, "pets[0]"),
            Some(&json!({"type": "Dog", "name": "Whiskey", "age": 3}))
        );
        assert_eq!(get(&data, "pets[0].age"), Some(&json!(3)));
    }

    #[test]
    fn test_get_missing_is_none() {
        let data = sample();
        assert_eq!(get(&data, "missing"), None);
        assert_eq!(get(&data, "pets[4].age"), None);
        assert_eq!(get(&data, "name.inner"), None);
    }

    #[test]
    fn test_set_existing_member() {
        let mut data = sample();
        set(&mut data, "name", json!("Wolfram"));
        assert_eq!(get(&data, "name"), Some(&json!("Wolfram")));
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut data = json!({});
        set(&mut data, "address.city", json!("Berlin"));
        assert_eq!(data, json!({"address": {"city": "Berlin"}}));
    }

    #[test]
    fn test_set_grows_arrays() {
        let mut data = json!({});
        set(&mut data, "pets[2]", json!("cat"));
        assert_eq!(data, json!({"pets": [null, null, "cat"]}));
    }

    #[test]
    fn test_set_nested_array_member() {
        let mut data = sample();
        set(&mut data, "pets[0].age", json!(4));
        assert_eq!(get(&data, "pets[0].age"), Some(&json!(4)));
    }

    #[test]
    fn test_set_replaces_scalar_with_container() {
        let mut data = json!({"name": "Yasser"});
        set(&mut data, "name.first", json!("Y"));
        assert_eq!(data, json!({"name": {"first": "Y"}}));
    }

    #[test]
    fn test_delete_member() {
        let mut data = sample();
        delete(&mut data, "name");
        assert_eq!(get(&data, "name"), None);
    }

    #[test]
    fn test_delete_array_element_splices() {
        let mut data = json!({"list": ["a", "b", "c"]});
        delete(&mut data, "list[1]");
        assert_eq!(data, json!({"list": ["a", "c"]}));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let mut data = sample();
        delete(&mut data, "address.city");
        assert_eq!(data, sample());
    }

    #[test]
    fn test_empty_path_set_replaces_root() {
        let mut data = sample();
        set(&mut data, "", json!({"replaced": true}));
        assert_eq!(data, json!({"replaced": true}));
    }
}
