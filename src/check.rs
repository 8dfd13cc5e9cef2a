//! 响应校验与后置钩子
//!
//! 传输成功的响应先经过 [`check_response`] (合法 JSON + 2xx),
//! 再依次经过钩子链, 任一钩子返回 Err 都视为可重试的应用层错误。

use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::{PoolError, Result};
use crate::request::Request;
use crate::transport::RawResponse;

/// 合法 JSON 且状态码为 2xx 才接受
pub fn check_response(raw: &RawResponse) -> Result<Value> {
    if !(200..300).contains(&raw.status) {
        return Err(PoolError::Status(raw.status));
    }
    serde_json::from_slice(&raw.body).map_err(|e| PoolError::InvalidJson(e.to_string()))
}

/// 把形式上成功的响应重新归类为需要重试的失败
pub trait ResponseHook: Send + Sync {
    fn check(
        &self,
        endpoint: &Endpoint,
        request: &Request,
        raw: &RawResponse,
        parsed: &Value,
    ) -> std::result::Result<(), String>;
}

/// 请求体是数组而响应不是数组: 节点不支持批量
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchSupportHook;

impl ResponseHook for BatchSupportHook {
    fn check(
        &self,
        endpoint: &Endpoint,
        request: &Request,
        _raw: &RawResponse,
        parsed: &Value,
    ) -> std::result::Result<(), String> {
        if request.body.is_array() && !parsed.is_array() {
            return Err(format!("{} does not support batch requests", endpoint.url));
        }
        Ok(())
    }
}

/// 单条响应中某个错误字段存在且没有 `result` 时拒绝
#[derive(Debug, Clone)]
pub struct ErrorFieldHook {
    path: String,
}

impl ErrorFieldHook {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl ResponseHook for ErrorFieldHook {
    fn check(
        &self,
        _endpoint: &Endpoint,
        _request: &Request,
        _raw: &RawResponse,
        parsed: &Value,
    ) -> std::result::Result<(), String> {
        if !parsed.is_object() || parsed.get("result").is_some() {
            return Ok(());
        }
        match json_path(parsed, &self.path) {
            Some(found) if !found.is_null() => Err(format!("{} = {}", self.path, found)),
            _ => Ok(()),
        }
    }
}

/// 按点分路径取值, 数字段作为数组下标, 例如 `error.data.0.code`
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        Value::Object(map) => map.get(segment),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_json_2xx() {
        let raw = RawResponse::new(200, r#"{"result":1}"#);
        assert_eq!(check_response(&raw).unwrap(), json!({"result": 1}));
    }

    #[test]
    fn rejects_status_and_garbage() {
        assert_eq!(
            check_response(&RawResponse::new(502, "{}")).unwrap_err(),
            PoolError::Status(502)
        );
        assert!(matches!(
            check_response(&RawResponse::new(200, "<html>")),
            Err(PoolError::InvalidJson(_))
        ));
    }

    #[test]
    fn batch_hook_flags_object_for_array_body() {
        let hook = BatchSupportHook;
        let endpoint = Endpoint::new("http://a");
        let raw = RawResponse::new(200, "{}");
        let batch = Request::new("b", "POST", json!([{"id": 1}]));
        let single = Request::new("s", "POST", json!({"id": 1}));
        assert!(hook.check(&endpoint, &batch, &raw, &json!({"result": 1})).is_err());
        assert!(hook.check(&endpoint, &batch, &raw, &json!([{"result": 1}])).is_ok());
        assert!(hook.check(&endpoint, &single, &raw, &json!({"result": 1})).is_ok());
    }

    #[test]
    fn error_field_hook() {
        let hook = ErrorFieldHook::new("error.code");
        let endpoint = Endpoint::new("http://a");
        let raw = RawResponse::new(200, "{}");
        let req = Request::new("s", "POST", json!({}));
        assert!(hook
            .check(&endpoint, &req, &raw, &json!({"error": {"code": -32005}}))
            .is_err());
        assert!(hook
            .check(&endpoint, &req, &raw, &json!({"result": 1, "error": {"code": 1}}))
            .is_ok());
        assert!(hook.check(&endpoint, &req, &raw, &json!({"result": null})).is_ok());
    }

    #[test]
    fn json_path_walks_objects_and_arrays() {
        let v = json!({"a": [{"b": 1}, {"b": 2}]});
        assert_eq!(json_path(&v, "a.1.b"), Some(&json!(2)));
        assert_eq!(json_path(&v, "a.x"), None);
        assert_eq!(json_path(&v, "a.5.b"), None);
        assert_eq!(json_path(&v, ""), Some(&v));
    }
}
