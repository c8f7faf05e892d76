use serde::Serialize;

/// Pipeline stages, in frame order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DetectVehicles,
    CalculateSpeed,
    CheckViolation,
    ExtractPlate,
    Save,
    GenerateReport,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::DetectVehicles => "detect_vehicles",
            Stage::CalculateSpeed => "calculate_speed",
            Stage::CheckViolation => "check_violation",
            Stage::ExtractPlate => "extract_plate",
            Stage::Save => "save",
            Stage::GenerateReport => "generate_report",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage reports back to the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Stage succeeded and produced input for its successor.
    Advance,
    /// No input for the successor, or the stage failed.
    Halt,
}

/// Next-stage directive recorded on the context after every stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Run(Stage),
    End,
}

/// The three stage graphs the pipeline can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Graph {
    /// Every stage, once per frame.
    Combined,
    /// Detection through plate extraction, once per frame.
    PerFrame,
    /// Save and report, once after the stream ends.
    Finalize,
}

impl Graph {
    pub fn entry(self) -> Stage {
        match self {
            Graph::Combined | Graph::PerFrame => Stage::DetectVehicles,
            Graph::Finalize => Stage::Save,
        }
    }

    pub fn transition(self, from: Stage, flow: Flow) -> Directive {
        if flow == Flow::Halt {
            return Directive::End;
        }
        match (self, from) {
            (_, Stage::DetectVehicles) => Directive::Run(Stage::CalculateSpeed),
            (_, Stage::CalculateSpeed) => Directive::Run(Stage::CheckViolation),
            (_, Stage::CheckViolation) => Directive::Run(Stage::ExtractPlate),
            (Graph::PerFrame, Stage::ExtractPlate) => Directive::End,
            (Graph::Combined | Graph::Finalize, Stage::ExtractPlate) => Directive::Run(Stage::Save),
            (_, Stage::Save) => Directive::Run(Stage::GenerateReport),
            (_, Stage::GenerateReport) => Directive::End,
        }
    }

    /// Stages reachable in this graph when every stage advances.
    pub fn stages(self) -> Vec<Stage> {
        let mut out = Vec::new();
        let mut next = Directive::Run(self.entry());
        while let Directive::Run(stage) = next {
            out.push(stage);
            next = self.transition(stage, Flow::Advance);
        }
        out
    }
}
