//! Control vocabulary carried by `Action` and `ActionSimulation` messages

use crate::error::{LinkError, Result};

/// Separator between an action name and its parameter
pub const FIELD_SEP: char = ',';

/// Fire-and-forget control action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionCommand {
    /// Quit the remote application
    QuitApp,
    /// Start tutoring: log in as coach and stream client to server
    Start,
    /// Stream headset to PC
    HeadsetToPc,
    /// Stream PC to headset
    PcToHeadset,
    SwitchAll,
    SwitchPlane,
    EnableCocktail,
    EnablePancake,
    SwitchCocktail,
    SwitchPancake,
    /// Show menu, secondary menu and plane
    ShowUis,
    /// Force the hand tracker to drop what it holds
    ReleaseHand,
    Record,
    Replay,
    /// Capture an image of the given object for registration
    Capture(i32),
    /// Set the object-camera-hand angle threshold
    Threshold(f32),
    /// Toggle a single object by name
    SwitchOne(String),
}

impl ActionCommand {
    /// Wire name without parameter
    pub fn name(&self) -> &'static str {
        match self {
            ActionCommand::QuitApp => "ActionQuitApp",
            ActionCommand::Start => "ActionStart",
            ActionCommand::HeadsetToPc => "ActionHL2PC",
            ActionCommand::PcToHeadset => "ActionPC2HL2",
            ActionCommand::SwitchAll => "ActionSwitchAll",
            ActionCommand::SwitchPlane => "ActionSwitchPlane",
            ActionCommand::EnableCocktail => "ActionShowCocktail",
            ActionCommand::EnablePancake => "ActionEnablePancake",
            ActionCommand::SwitchCocktail => "ActionSwitchCocktail",
            ActionCommand::SwitchPancake => "ActionSwitchPancake",
            ActionCommand::ShowUis => "ActionShowUIs",
            ActionCommand::ReleaseHand => "ActionReleaseHand",
            ActionCommand::Record => "ActionRecord",
            ActionCommand::Replay => "ActionReplay",
            ActionCommand::Capture(_) => "ActionCapture",
            ActionCommand::Threshold(_) => "ActionThreshold",
            ActionCommand::SwitchOne(_) => "ActionSwitchOne",
        }
    }

    /// Full wire string, `name` or `name,param`
    pub fn to_wire(&self) -> String {
        match self {
            ActionCommand::Capture(id) => format!("{}{}{}", self.name(), FIELD_SEP, id),
            ActionCommand::Threshold(value) => format!("{}{}{}", self.name(), FIELD_SEP, value),
            ActionCommand::SwitchOne(name) => format!("{}{}{}", self.name(), FIELD_SEP, name),
            _ => self.name().to_string(),
        }
    }

    /// Parse a wire string, splitting at the first separator
    pub fn parse(s: &str) -> Result<Self> {
        let unknown = || LinkError::UnknownAction(s.to_string());

        if let Some((name, param)) = s.split_once(FIELD_SEP) {
            return match name {
                "ActionCapture" => param
                    .trim()
                    .parse()
                    .map(ActionCommand::Capture)
                    .map_err(|_| unknown()),
                "ActionThreshold" => param
                    .trim()
                    .parse()
                    .map(ActionCommand::Threshold)
                    .map_err(|_| unknown()),
                "ActionSwitchOne" => Ok(ActionCommand::SwitchOne(param.to_string())),
                _ => Err(unknown()),
            };
        }

        let command = match s {
            "ActionQuitApp" => ActionCommand::QuitApp,
            "ActionStart" => ActionCommand::Start,
            "ActionHL2PC" => ActionCommand::HeadsetToPc,
            "ActionPC2HL2" => ActionCommand::PcToHeadset,
            "ActionSwitchAll" => ActionCommand::SwitchAll,
            "ActionSwitchPlane" => ActionCommand::SwitchPlane,
            "ActionShowCocktail" => ActionCommand::EnableCocktail,
            "ActionEnablePancake" => ActionCommand::EnablePancake,
            "ActionSwitchCocktail" => ActionCommand::SwitchCocktail,
            "ActionSwitchPancake" => ActionCommand::SwitchPancake,
            "ActionShowUIs" => ActionCommand::ShowUis,
            "ActionReleaseHand" => ActionCommand::ReleaseHand,
            "ActionRecord" => ActionCommand::Record,
            "ActionReplay" => ActionCommand::Replay,
            _ => return Err(unknown()),
        };
        Ok(command)
    }
}

impl std::fmt::Display for ActionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Remote UI action used to drive one peer's menu from the other peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedAction {
    Pancake,
    Cocktail,
    Lock,
    UnLock,
    Coach,
    Trainee,
    Quit,
    ShowUis,
    HeadsetToPc,
    PcToHeadset,
    Debug,
    Reset,
    ToCocktail,
    Banana,
    BananaSlices,
    Egg1,
    Egg2,
    Cake,
    Lime,
    Rum,
    Ice,
}

impl SimulatedAction {
    /// All actions, indexed by wire code
    pub const ALL: [SimulatedAction; 21] = [
        SimulatedAction::Pancake,
        SimulatedAction::Cocktail,
        SimulatedAction::Lock,
        SimulatedAction::UnLock,
        SimulatedAction::Coach,
        SimulatedAction::Trainee,
        SimulatedAction::Quit,
        SimulatedAction::ShowUis,
        SimulatedAction::HeadsetToPc,
        SimulatedAction::PcToHeadset,
        SimulatedAction::Debug,
        SimulatedAction::Reset,
        SimulatedAction::ToCocktail,
        SimulatedAction::Banana,
        SimulatedAction::BananaSlices,
        SimulatedAction::Egg1,
        SimulatedAction::Egg2,
        SimulatedAction::Cake,
        SimulatedAction::Lime,
        SimulatedAction::Rum,
        SimulatedAction::Ice,
    ];

    /// Integer code on the wire
    pub fn code(&self) -> i32 {
        Self::ALL
            .iter()
            .position(|a| a == self)
            .and_then(|i| i32::try_from(i).ok())
            .unwrap_or(-1)
    }

    /// Look up an action by wire code
    pub fn from_code(code: i32) -> Result<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(LinkError::UnknownSimulation(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_actions() {
        assert_eq!(ActionCommand::parse("ActionQuitApp").unwrap(), ActionCommand::QuitApp);
        assert_eq!(ActionCommand::parse("ActionPC2HL2").unwrap(), ActionCommand::PcToHeadset);
        assert_eq!(
            ActionCommand::parse("ActionShowCocktail").unwrap(),
            ActionCommand::EnableCocktail
        );
    }

    #[test]
    fn test_parse_parameterized_actions() {
        assert_eq!(ActionCommand::parse("ActionCapture,7").unwrap(), ActionCommand::Capture(7));
        assert_eq!(
            ActionCommand::parse("ActionThreshold,20.5").unwrap(),
            ActionCommand::Threshold(20.5)
        );
        assert_eq!(
            ActionCommand::parse("ActionSwitchOne,Bowl").unwrap(),
            ActionCommand::SwitchOne("Bowl".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_unknown_or_bad_params() {
        assert!(ActionCommand::parse("ActionDance").is_err());
        assert!(ActionCommand::parse("ActionCapture,seven").is_err());
        assert!(ActionCommand::parse("ActionQuitApp,now").is_err());
        assert!(ActionCommand::parse("").is_err());
    }

    #[test]
    fn test_wire_strings_parse_back() {
        let commands = [
            ActionCommand::Start,
            ActionCommand::HeadsetToPc,
            ActionCommand::Capture(3),
            ActionCommand::Threshold(12.0),
            ActionCommand::SwitchOne("Knife".to_string()),
        ];
        for command in commands {
            assert_eq!(ActionCommand::parse(&command.to_wire()).unwrap(), command);
        }
        assert_eq!(ActionCommand::Capture(3).to_string(), "ActionCapture,3");
    }

    #[test]
    fn test_simulated_codes() {
        assert_eq!(SimulatedAction::Pancake.code(), 0);
        assert_eq!(SimulatedAction::Ice.code(), 20);
        assert_eq!(SimulatedAction::from_code(4).unwrap(), SimulatedAction::Coach);
        assert!(SimulatedAction::from_code(21).is_err());
        assert!(SimulatedAction::from_code(-1).is_err());
    }
}
