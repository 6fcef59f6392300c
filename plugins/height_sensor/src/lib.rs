//! Noisy height sensor with a range check.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rsis_model_helper::{
    field, Channels, ConfigStatus, Model, Reflected, Reflector, RuntimeStatus,
};
use std::ffi::CStr;
use std::mem::offset_of;

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct HeightSensorIn {
    pub signal: f64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct HeightSensorOut {
    pub inrange: bool,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct HeightSensorData {
    pub measurement: f64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct HeightSensorParams {
    /// Lower and upper bound of the valid range
    pub limits: [f64; 2],
    /// Standard deviation of the measurement noise
    pub noise: f64,
    pub seed: u64,
}

impl Reflected for HeightSensorIn {
    fn type_name() -> &'static str {
        "height_sensor_in"
    }
}

impl Reflected for HeightSensorOut {
    fn type_name() -> &'static str {
        "height_sensor_out"
    }
}

impl Reflected for HeightSensorData {
    fn type_name() -> &'static str {
        "height_sensor_data"
    }
}

impl Reflected for HeightSensorParams {
    fn type_name() -> &'static str {
        "height_sensor_params"
    }
}

#[repr(C)]
pub struct HeightSensor {
    pub input: HeightSensorIn,
    pub output: HeightSensorOut,
    pub data: HeightSensorData,
    pub params: HeightSensorParams,
    rng: StdRng,
}

impl Default for HeightSensor {
    fn default() -> Self {
        Self {
            input: HeightSensorIn::default(),
            output: HeightSensorOut::default(),
            data: HeightSensorData::default(),
            params: HeightSensorParams::default(),
            rng: StdRng::seed_from_u64(0),
        }
    }
}

impl HeightSensor {
    /// One standard normal sample (Box-Muller)
    fn gaussian(&mut self) -> f64 {
        // gen() is in [0, 1); keep u1 away from zero for ln
        let u1 = 1.0 - self.rng.gen::<f64>();
        let u2 = self.rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

impl Model for HeightSensor {
    const TYPE_NAME: &'static CStr = c"height_sensor";

    fn reflect(r: &mut Reflector) {
        r.class("height_sensor_in").field(
            "height_sensor_in",
            field::<f64>("signal", offset_of!(HeightSensorIn, signal)).units("m"),
        );
        r.class("height_sensor_out").field(
            "height_sensor_out",
            field::<bool>("inrange", offset_of!(HeightSensorOut, inrange)),
        );
        r.class("height_sensor_data").field(
            "height_sensor_data",
            field::<f64>("measurement", offset_of!(HeightSensorData, measurement)).units("m"),
        );
        r.class("height_sensor_params")
            .field(
                "height_sensor_params",
                field::<[f64; 2]>("limits", offset_of!(HeightSensorParams, limits)).units("m"),
            )
            .field(
                "height_sensor_params",
                field::<f64>("noise", offset_of!(HeightSensorParams, noise)).units("m"),
            )
            .field(
                "height_sensor_params",
                field::<u64>("seed", offset_of!(HeightSensorParams, seed)),
            );
        r.class("height_sensor")
            .field("height_sensor", field::<HeightSensorIn>("in", offset_of!(HeightSensor, input)))
            .field("height_sensor", field::<HeightSensorOut>("out", offset_of!(HeightSensor, output)))
            .field("height_sensor", field::<HeightSensorData>("data", offset_of!(HeightSensor, data)))
            .field(
                "height_sensor",
                field::<HeightSensorParams>("params", offset_of!(HeightSensor, params)),
            );
    }

    fn config(&mut self) -> ConfigStatus {
        let [low, high] = self.params.limits;
        if high < low || self.params.noise < 0.0 || self.params.noise.is_nan() {
            return ConfigStatus::Error;
        }
        self.rng = StdRng::seed_from_u64(self.params.seed);
        ConfigStatus::Ok
    }

    fn init(&mut self, _channels: &mut Channels<'_>) -> RuntimeStatus {
        self.data.measurement = self.input.signal;
        RuntimeStatus::Ok
    }

    fn step(&mut self) -> RuntimeStatus {
        let noise = if self.params.noise > 0.0 {
            self.params.noise * self.gaussian()
        } else {
            0.0
        };
        self.data.measurement = self.input.signal + noise;
        let [low, high] = self.params.limits;
        self.output.inrange = (low..=high).contains(&self.data.measurement);
        RuntimeStatus::Ok
    }
}

rsis_model_helper::export_models! {
    name: "height_sensor",
    version: "0.1.0",
    description: "Height sensor with gaussian noise and a range check",
    models: [HeightSensor],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(limits: [f64; 2], noise: f64) -> HeightSensor {
        let mut s = HeightSensor::default();
        s.params.limits = limits;
        s.params.noise = noise;
        s
    }

    #[test]
    fn test_config_checks_limits() {
        assert_eq!(sensor([0.0, 10.0], 0.0).config(), ConfigStatus::Ok);
        assert_eq!(sensor([10.0, 0.0], 0.0).config(), ConfigStatus::Error);
        assert_eq!(sensor([0.0, 10.0], -1.0).config(), ConfigStatus::Error);
    }

    #[test]
    fn test_step_without_noise() {
        let mut s = sensor([0.0, 10.0], 0.0);
        s.config();
        s.input.signal = 5.0;
        s.step();
        assert_eq!(s.data.measurement, 5.0);
        assert!(s.output.inrange);

        s.input.signal = 99.0;
        s.step();
        assert!(!s.output.inrange);
    }

    #[test]
    fn test_noise_is_seeded() {
        let run = |seed| {
            let mut s = sensor([0.0, 10.0], 0.5);
            s.params.seed = seed;
            s.config();
            s.input.signal = 5.0;
            (0..16)
                .map(|_| {
                    s.step();
                    s.data.measurement
                })
                .collect::<Vec<_>>()
        };
        let a = run(7);
        assert_eq!(a, run(7));
        assert_ne!(a, run(8));
        assert!(a.iter().all(|m| m.is_finite() && (m - 5.0).abs() < 5.0));
    }
}
