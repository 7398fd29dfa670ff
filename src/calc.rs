//! The closed set of method/basis combinations a unit can be computed with.
//! Labels are the short forms used in input filenames, like the `ccsd` and
//! `631gs` in `dsgdb9nsd_000053_ccsd_631gs.inp`.

use std::{fmt::Display, str::FromStr};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Hf,
    Mp2,
    Ccsd,
    CcsdT,
}

impl Method {
    pub const ALL: [Method; 4] =
        [Method::Hf, Method::Mp2, Method::Ccsd, Method::CcsdT];

    /// the label used in filenames
    pub fn label(&self) -> &'static str {
        match self {
            Method::Hf => "hf",
            Method::Mp2 => "mp2",
            Method::Ccsd => "ccsd",
            Method::CcsdT => "ccsdt",
        }
    }

    /// the keyword ORCA expects on the `!` line
    pub fn keyword(&self) -> &'static str {
        match self {
            Method::Hf => "HF",
            Method::Mp2 => "MP2",
            Method::Ccsd => "CCSD",
            Method::CcsdT => "CCSD(T)",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Basis {
    Sto3g,
    B321g,
    B631g,
    B631gs,
    B631gss,
    B631pgss,
    CcPvdz,
    CcPvtz,
    AugCcPvdz,
    Def2Svp,
    Def2Tzvp,
    Def2Qzvpp,
}

impl Basis {
    pub const ALL: [Basis; 12] = [
        Basis::Sto3g,
        Basis::B321g,
        Basis::B631g,
        Basis::B631gs,
        Basis::B631gss,
        Basis::B631pgss,
        Basis::CcPvdz,
        Basis::CcPvtz,
        Basis::AugCcPvdz,
        Basis::Def2Svp,
        Basis::Def2Tzvp,
        Basis::Def2Qzvpp,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Basis::Sto3g => "sto3g",
            Basis::B321g => "321g",
            Basis::B631g => "631g",
            Basis::B631gs => "631gs",
            Basis::B631gss => "631gss",
            Basis::B631pgss => "631pgss",
            Basis::CcPvdz => "ccpvdz",
            Basis::CcPvtz => "ccpvtz",
            Basis::AugCcPvdz => "augccpvdz",
            Basis::Def2Svp => "def2svp",
            Basis::Def2Tzvp => "def2tzvp",
            Basis::Def2Qzvpp => "def2qzvpp",
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Basis::Sto3g => "STO-3G",
            Basis::B321g => "3-21G",
            Basis::B631g => "6-31G",
            Basis::B631gs => "6-31G*",
            Basis::B631gss => "6-31G**",
            Basis::B631pgss => "6-31+G**",
            Basis::CcPvdz => "cc-pVDZ",
            Basis::CcPvtz => "cc-pVTZ",
            Basis::AugCcPvdz => "aug-cc-pVDZ",
            Basis::Def2Svp => "def2-SVP",
            Basis::Def2Tzvp => "def2-TZVP",
            Basis::Def2Qzvpp => "def2-QZVPP",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Method::ALL
            .into_iter()
            .find(|m| m.label() == s || m.keyword().to_lowercase() == s)
            .ok_or_else(|| Error::Config(format!("unknown method `{s}`")))
    }
}

impl FromStr for Basis {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Basis::ALL
            .into_iter()
            .find(|b| b.label() == s || b.keyword().to_lowercase() == s)
            .ok_or_else(|| Error::Config(format!("unknown basis `{s}`")))
    }
}

/// One method × basis combination
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Calc {
    pub method: Method,
    pub basis: Basis,
}

impl Calc {
    pub fn new(method: Method, basis: Basis) -> Self {
        Self { method, basis }
    }

    /// the `<method>_<basis>` suffix appended to a unit key to form the job
    /// basename
    pub fn suffix(&self) -> String {
        format!("{}_{}", self.method.label(), self.basis.label())
    }
}

/// parse strings like `ccsd/631gs` or `CCSD(T)/cc-pVTZ`
impl FromStr for Calc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((m, b)) = s.split_once('/') else {
            return Err(Error::Config(format!(
                "calc `{s}` should look like <method>/<basis>"
            )));
        };
        Ok(Self::new(m.parse()?, b.parse()?))
    }
}

impl Display for Calc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.method.label(), self.basis.label())
    }
}
