use std::f64::consts::{E, PI, TAU};

pub(super) const VARIABLES: &[(&str, f64)] = &[
    ("pi", PI),
    ("e", E),
    ("tau", TAU),
    // golden ratio, (1 + sqrt 5) / 2
    ("phi", 1.618_033_988_749_895),
    ("inf", f64::INFINITY),
    ("nan", f64::NAN),
    ("degToRad", PI / 180.0),
    ("radToDeg", 180.0 / PI),
];

type Builtin = (&'static str, fn(&[f64]) -> f64, usize);

pub(super) const FUNCTIONS: &[Builtin] = &[
    ("sin", |p: &[f64]| p[0].sin(), 1),
    ("cos", |p: &[f64]| p[0].cos(), 1),
    ("tan", |p: &[f64]| p[0].tan(), 1),
    ("asin", |p: &[f64]| p[0].asin(), 1),
    ("acos", |p: &[f64]| p[0].acos(), 1),
    ("atan", |p: &[f64]| p[0].atan(), 1),
    ("atan2", |p: &[f64]| p[0].atan2(p[1]), 2),
    ("sinh", |p: &[f64]| p[0].sinh(), 1),
    ("cosh", |p: &[f64]| p[0].cosh(), 1),
    ("tanh", |p: &[f64]| p[0].tanh(), 1),
    ("sqrt", |p: &[f64]| p[0].sqrt(), 1),
    ("cbrt", |p: &[f64]| p[0].cbrt(), 1),
    ("root", |p: &[f64]| p[0].powf(1.0 / p[1]), 2),
    ("exp", |p: &[f64]| p[0].exp(), 1),
    ("abs", |p: &[f64]| p[0].abs(), 1),
    ("log", |p: &[f64]| p[0].ln(), 1),
    ("log10", |p: &[f64]| p[0].log10(), 1),
    ("log2", |p: &[f64]| p[0].log2(), 1),
    ("logn", |p: &[f64]| p[0].log(p[1]), 2),
    ("pow", |p: &[f64]| p[0].powf(p[1]), 2),
    ("mod", |p: &[f64]| p[0] % p[1], 2),
    ("min", |p: &[f64]| p[0].min(p[1]), 2),
    ("max", |p: &[f64]| p[0].max(p[1]), 2),
    ("floor", |p: &[f64]| p[0].floor(), 1),
    ("ceil", |p: &[f64]| p[0].ceil(), 1),
    ("round", |p: &[f64]| p[0].round_ties_even(), 1),
    ("sign", |p: &[f64]| sign(p[0]), 1),
    ("clamp", |p: &[f64]| clamp(p[0], p[1], p[2]), 3),
    ("lerp", |p: &[f64]| (p[2] - p[1]) * p[0] + p[1], 3),
    ("inverseLerp", |p: &[f64]| (p[0] - p[1]) / (p[2] - p[1]), 3),
];

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        // 0, -0 and NaN
        x * 0.0
    }
}

/// Unlike `f64::clamp`, never panics when `min > max`.
fn clamp(x: f64, min: f64, max: f64) -> f64 {
    if x < min {
        min
    } else if x > max {
        max
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, parameters: &[f64]) -> f64 {
        let (_, function, arity) = FUNCTIONS
            .iter()
            .find(|(identifier, _, _)| *identifier == name)
            .unwrap();
        assert_eq!(*arity, parameters.len());
        function(parameters)
    }

    #[test]
    fn test_identifiers_are_unique() {
        let mut names: Vec<_> = FUNCTIONS.iter().map(|(name, _, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), FUNCTIONS.len());
    }

    #[test]
    fn test_round_half_to_even() {
        assert_eq!(call("round", &[2.5]), 2.0);
        assert_eq!(call("round", &[3.5]), 4.0);
        assert_eq!(call("round", &[-2.5]), -2.0);
    }

    #[test]
    fn test_sign() {
        assert_eq!(call("sign", &[-3.0]), -1.0);
        assert_eq!(call("sign", &[0.0]), 0.0);
        assert_eq!(call("sign", &[7.0]), 1.0);
        assert!(call("sign", &[f64::NAN]).is_nan());
    }

    #[test]
    fn test_clamp_and_lerp() {
        assert_eq!(call("clamp", &[5.0, 0.0, 1.0]), 1.0);
        assert_eq!(call("clamp", &[-5.0, 0.0, 1.0]), 0.0);
        assert_eq!(call("clamp", &[0.5, 2.0, 1.0]), 2.0);
        assert_eq!(call("lerp", &[0.25, 0.0, 8.0]), 2.0);
        assert_eq!(call("inverseLerp", &[2.0, 0.0, 8.0]), 0.25);
    }

    #[test]
    fn test_logs_and_roots() {
        assert!((call("logn", &[8.0, 2.0]) - 3.0).abs() < 1e-12);
        assert!((call("root", &[27.0, 3.0]) - 3.0).abs() < 1e-12);
        assert_eq!(call("mod", &[-7.0, 3.0]), -1.0);
    }
}
