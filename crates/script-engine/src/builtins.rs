//! Extra built-ins registered on top of the standard packages.

use std::cmp::Ordering;

use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Position};

type FnResult<T> = Result<T, Box<EvalAltResult>>;

fn runtime_error<T>(message: String) -> FnResult<T> {
    Err(EvalAltResult::ErrorRuntime(message.into(), Position::NONE).into())
}

pub(crate) fn register_str(engine: &mut Engine) {
    engine.register_fn("str", |value: Dynamic| -> String {
        if value.is_unit() {
            "()".to_owned()
        } else {
            value.to_string()
        }
    });
}

pub(crate) fn register_int(engine: &mut Engine) {
    engine.register_fn("int", |value: rhai::INT| value);
    engine.register_fn("int", |value: bool| rhai::INT::from(value));
    engine.register_fn("int", |value: rhai::FLOAT| -> FnResult<rhai::INT> {
        if !value.is_finite() {
            return runtime_error(format!("cannot convert {value} to int"));
        }
        Ok(value.trunc() as rhai::INT)
    });
    engine.register_fn("int", |text: ImmutableString| -> FnResult<rhai::INT> {
        text.trim()
            .parse::<rhai::INT>()
            .or_else(|_| runtime_error(format!("invalid literal for int(): '{text}'")))
    });
}

pub(crate) fn register_float(engine: &mut Engine) {
    engine.register_fn("float", |value: rhai::FLOAT| value);
    engine.register_fn("float", |value: rhai::INT| value as rhai::FLOAT);
    engine.register_fn("float", |text: ImmutableString| -> FnResult<rhai::FLOAT> {
        text.trim()
            .parse::<rhai::FLOAT>()
            .or_else(|_| runtime_error(format!("could not convert string to float: '{text}'")))
    });
}

pub(crate) fn register_bool(engine: &mut Engine) {
    engine.register_fn("bool", |value: Dynamic| truthy(&value));
}

pub(crate) fn register_sum(engine: &mut Engine) {
    engine.register_fn("sum", |items: Array| -> FnResult<Dynamic> {
        let mut int_total: rhai::INT = 0;
        let mut float_total: Option<rhai::FLOAT> = None;
        for item in &items {
            if let Ok(n) = item.as_int() {
                match float_total.as_mut() {
                    Some(f) => *f += n as rhai::FLOAT,
                    None => {
                        int_total = int_total.checked_add(n).ok_or_else(|| {
                            Box::new(EvalAltResult::ErrorArithmetic(
                                "integer overflow in sum()".into(),
                                Position::NONE,
                            ))
                        })?;
                    }
                }
            } else if let Ok(f) = item.as_float() {
                let total = float_total.get_or_insert(int_total as rhai::FLOAT);
                *total += f;
            } else {
                return runtime_error(format!(
                    "sum() expects numbers, found {}",
                    item.type_name()
                ));
            }
        }
        Ok(match float_total {
            Some(f) => f.into(),
            None => int_total.into(),
        })
    });
}

pub(crate) fn register_sorted(engine: &mut Engine) {
    engine.register_fn("sorted", |items: Array| -> FnResult<Array> {
        let mut items = items;
        if items.iter().all(Dynamic::is_int) {
            items.sort_by_key(|d| d.as_int().unwrap_or_default());
        } else if items.iter().all(|d| d.is_int() || d.is_float()) {
            items.sort_by(|a, b| {
                as_number(a)
                    .partial_cmp(&as_number(b))
                    .unwrap_or(Ordering::Equal)
            });
        } else if items.iter().all(Dynamic::is_string) {
            items.sort_by_cached_key(|d| d.to_string());
        } else {
            return runtime_error("sorted() needs elements of one comparable type".to_owned());
        }
        Ok(items)
    });
}

pub(crate) fn register_enumerate(engine: &mut Engine) {
    engine.register_fn("enumerate", |items: Array| -> Array {
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let pair: Array = vec![(i as rhai::INT).into(), item];
                Dynamic::from_array(pair)
            })
            .collect()
    });
}

pub(crate) fn register_zip(engine: &mut Engine) {
    engine.register_fn("zip", |left: Array, right: Array| -> Array {
        left.into_iter()
            .zip(right)
            .map(|(a, b)| Dynamic::from_array(vec![a, b]))
            .collect()
    });
}

fn as_number(value: &Dynamic) -> rhai::FLOAT {
    value
        .as_float()
        .or_else(|_| value.as_int().map(|n| n as rhai::FLOAT))
        .unwrap_or(rhai::FLOAT::NAN)
}

fn truthy(value: &Dynamic) -> bool {
    if value.is_unit() {
        return false;
    }
    if let Ok(b) = value.as_bool() {
        return b;
    }
    if let Ok(n) = value.as_int() {
        return n != 0;
    }
    if let Ok(f) = value.as_float() {
        return f != 0.0;
    }
    if value.is_string() {
        return !value.to_string().is_empty();
    }
    if value.is_array() {
        return value.clone().into_array().is_ok_and(|a| !a.is_empty());
    }
    if value.is_map() {
        return value.clone().try_cast::<rhai::Map>().is_some_and(|m| !m.is_empty());
    }
    true
}
