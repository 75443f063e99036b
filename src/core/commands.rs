//! 模式命令：在调用模型之前拦截，直接修改模式或清空会话，返回固定回执

use crate::memory::Mode;

pub const HELP_TEXT: &str = "本助手有三种模式，#聊天模式 = #1 ，#工具模式 = #2 ，#代码模式 = #3 , #清除模式会话 = #4 , #清除全部会话 = #5 可用发送#对应模式 或者 #编号 进行切换";
pub const CLEARED_TEXT: &str = "已清除";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeCommand {
    Help,
    Switch(Mode),
    /// 清空当前模式的会话
    ClearMode,
    /// 清空该 peer 所有模式的会话
    ClearAll,
}

impl ModeCommand {
    /// 整条消息（去掉首尾空白）恰好是命令时返回 Some
    pub fn parse(text: &str) -> Option<Self> {
        let cmd = match text.trim() {
            "#帮助" | "#help" => ModeCommand::Help,
            "#聊天模式" | "#1" | "#chat-mode" => ModeCommand::Switch(Mode::Chat),
            "#工具模式" | "#2" | "#tool-mode" => ModeCommand::Switch(Mode::Tool),
            "#代码模式" | "#3" | "#code-mode" => ModeCommand::Switch(Mode::Code),
            "#清除模式会话" | "#4" | "#clear-mode" => ModeCommand::ClearMode,
            "#清除全部会话" | "#5" | "#clear-all" => ModeCommand::ClearAll,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn acknowledgement(&self) -> &'static str {
        match self {
            ModeCommand::Help => HELP_TEXT,
            ModeCommand::Switch(Mode::Chat) => "已切换#聊天模式",
            ModeCommand::Switch(Mode::Tool) => {
                "已切换#工具模式 \n工具有：查看天气，日期，新闻。例如：\n北京今天天气怎么样"
            }
            ModeCommand::Switch(Mode::Code) => {
                "已切换#代码模式 \n代码模式可以用于写python代码，例如：\n用python画一个爱心"
            }
            ModeCommand::ClearMode | ModeCommand::ClearAll => CLEARED_TEXT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(ModeCommand::parse("#帮助"), Some(ModeCommand::Help));
        assert_eq!(ModeCommand::parse("#help"), Some(ModeCommand::Help));
        assert_eq!(ModeCommand::parse(" #3 "), Some(ModeCommand::Switch(Mode::Code)));
        assert_eq!(ModeCommand::parse("#code-mode"), Some(ModeCommand::Switch(Mode::Code)));
        assert_eq!(ModeCommand::parse("#工具模式"), Some(ModeCommand::Switch(Mode::Tool)));
        assert_eq!(ModeCommand::parse("#4"), Some(ModeCommand::ClearMode));
        assert_eq!(ModeCommand::parse("#clear-all"), Some(ModeCommand::ClearAll));
    }

    #[test]
    fn test_non_commands() {
        assert_eq!(ModeCommand::parse("#6"), None);
        assert_eq!(ModeCommand::parse("请切换 #1"), None);
        assert_eq!(ModeCommand::parse("hello"), None);
    }

    #[test]
    fn test_acknowledgements() {
        assert_eq!(
            ModeCommand::Switch(Mode::Chat).acknowledgement(),
            "已切换#聊天模式"
        );
        assert!(ModeCommand::Switch(Mode::Code)
            .acknowledgement()
            .starts_with("已切换#代码模式"));
        assert_eq!(ModeCommand::ClearAll.acknowledgement(), "已清除");
    }
}
